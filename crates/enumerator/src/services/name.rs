use crate::error::{Error, Result};
use crate::events::Engine;
use crate::model::{parent_name, Discovery, Request, ResolvedName};
use crate::service::{pause_point, Service, ServiceBase};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;

/// Entry point for every candidate name and sink for every validated one.
/// Candidates are routed towards DNS resolution; validated names are written
/// to the graph, emitted on the output channel and fanned out to every
/// interested service.
pub struct NameService {
    base: ServiceBase,
    engine: Arc<Engine>,
    resolved_tx: mpsc::Sender<ResolvedName>,
    resolved_rx: Mutex<Option<mpsc::Receiver<ResolvedName>>>,
    // sightings per subdomain, drives the recursion hooks
    sub_counts: Mutex<HashMap<String, usize>>,
}

impl NameService {
    pub fn new(engine: &Arc<Engine>) -> Arc<Self> {
        let (resolved_tx, resolved_rx) = mpsc::channel(crate::service::REQUEST_QUEUE_CAPACITY);
        Arc::new(Self {
            base: ServiceBase::new("Name Service", engine.pause_rx()),
            engine: Arc::clone(engine),
            resolved_tx,
            resolved_rx: Mutex::new(Some(resolved_rx)),
            sub_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn resolved_tx(&self) -> mpsc::Sender<ResolvedName> {
        self.resolved_tx.clone()
    }

    async fn handle_resolved(&self, resolved: ResolvedName) {
        let req = &resolved.req;
        self.engine
            .graph
            .insert_name(&req.name, &req.domain, req.tag, &req.source);

        let mut addresses = Vec::with_capacity(resolved.addresses.len());
        for ip in &resolved.addresses {
            addresses.push(self.engine.asn_cache.enrich(ip).await);
        }

        info!("{:12} - {} ({})", "DISCOVERED", req.name, req.source);
        self.engine.output_event(Discovery {
            name: req.name.clone(),
            domain: req.domain.clone(),
            addresses,
            tag: req.tag,
            source: req.source.clone(),
        });

        self.engine.checked_name_event(&resolved).await;
        self.engine.active_cert_event(req.clone());

        if let Some(sub) = subdomain_of(&req.name, &req.domain) {
            let times = {
                let mut counts = self.sub_counts.lock().expect("subdomain counter lock poisoned");
                let count = counts.entry(sub.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            let sub_req = Request::name(sub, &req.domain, req.tag, &req.source);
            self.engine.new_subdomain_event(sub_req, times).await;
        }
    }
}

#[async_trait]
impl Service for NameService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        // candidate drain
        let svc = Arc::clone(&self);
        let mut rx = self.base.take_request_rx().ok_or(Error::AlreadyStarted)?;
        tokio::spawn(async move {
            let mut quit = svc.base.quit_rx();
            let mut pause = svc.base.pause_rx();
            loop {
                pause_point(&mut pause).await;
                tokio::select! {
                    _ = quit.changed() => return,
                    req = rx.recv() => {
                        let Some(req) = req else { return };
                        svc.base.set_active();
                        svc.engine.resolve_name_event(req).await;
                    }
                }
            }
        });

        // validated-name drain
        let svc = Arc::clone(&self);
        let mut rx = self
            .resolved_rx
            .lock()
            .expect("resolved queue lock poisoned")
            .take()
            .ok_or(Error::AlreadyStarted)?;
        tokio::spawn(async move {
            let mut quit = svc.base.quit_rx();
            let mut pause = svc.base.pause_rx();
            loop {
                pause_point(&mut pause).await;
                tokio::select! {
                    _ = quit.changed() => return,
                    resolved = rx.recv() => {
                        let Some(resolved) = resolved else { return };
                        svc.base.set_active();
                        svc.handle_resolved(resolved).await;
                    }
                }
            }
        });

        Ok(())
    }
}

/// The subdomain a validated name belongs to: its parent, as long as that
/// parent still sits under the root domain.
fn subdomain_of<'a>(name: &'a str, domain: &str) -> Option<&'a str> {
    let parent = parent_name(name)?;
    (parent == domain || parent.ends_with(&format!(".{domain}"))).then_some(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdomain_is_the_parent_under_the_root() {
        assert_eq!(
            subdomain_of("www.dev.example.com", "example.com"),
            Some("dev.example.com")
        );
        assert_eq!(subdomain_of("www.example.com", "example.com"), Some("example.com"));
        assert_eq!(subdomain_of("example.com", "example.com"), None);
        assert_eq!(subdomain_of("www.other.net", "example.com"), None);
    }
}
