use crate::error::{Error, Result};
use crate::events::Engine;
use crate::model::{Request, Tag};
use crate::service::{pause_point, Service, ServiceBase};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;

/// Expands every root domain (and, in recursive mode, every qualifying new
/// subdomain) against the configured wordlist.
pub struct BruteForceService {
    base: ServiceBase,
    engine: Arc<Engine>,
    subdomain_tx: mpsc::Sender<(Request, usize)>,
    subdomain_rx: Mutex<Option<mpsc::Receiver<(Request, usize)>>>,
}

impl BruteForceService {
    pub fn new(engine: &Arc<Engine>) -> Arc<Self> {
        let (subdomain_tx, subdomain_rx) = mpsc::channel(crate::service::REQUEST_QUEUE_CAPACITY);
        Arc::new(Self {
            base: ServiceBase::new("Brute Forcing", engine.pause_rx()),
            engine: Arc::clone(engine),
            subdomain_tx,
            subdomain_rx: Mutex::new(Some(subdomain_rx)),
        })
    }

    pub fn subdomain_tx(&self) -> mpsc::Sender<(Request, usize)> {
        self.subdomain_tx.clone()
    }

    async fn expand(&self, sub: &str, domain: &str) {
        info!("{:12} - {} ({} words)", "BRUTE", sub, self.engine.config.wordlist.len());
        let mut quit = self.base.quit_rx();
        let mut pause = self.base.pause_rx();

        for name in brute_names(&self.engine.config.wordlist, sub) {
            pause_point(&mut pause).await;
            if *quit.borrow() {
                return;
            }
            self.base.set_active();
            let req = Request::name(&name, domain, Tag::Brute, "Brute Forcing");
            self.engine.new_name_event(req).await;
        }
    }
}

#[async_trait]
impl Service for BruteForceService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        if !self.engine.config.brute_forcing {
            return Ok(());
        }

        // root-domain driver
        let svc = Arc::clone(&self);
        tokio::spawn(async move {
            for domain in svc.engine.config.domains.clone() {
                svc.expand(&domain, &domain).await;
            }
        });

        // recursive expansion of new subdomains
        let svc = Arc::clone(&self);
        let mut rx = self
            .subdomain_rx
            .lock()
            .expect("subdomain queue lock poisoned")
            .take()
            .ok_or(Error::AlreadyStarted)?;
        tokio::spawn(async move {
            let mut quit = svc.base.quit_rx();
            let mut pause = svc.base.pause_rx();
            loop {
                pause_point(&mut pause).await;
                tokio::select! {
                    _ = quit.changed() => return,
                    sub = rx.recv() => {
                        let Some((req, times)) = sub else { return };
                        if svc.engine.config.recursive
                            && times == svc.engine.config.min_for_recursive
                        {
                            svc.expand(&req.name, &req.domain).await;
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

pub(crate) fn brute_names(wordlist: &[String], sub: &str) -> Vec<String> {
    wordlist
        .iter()
        .filter(|word| !word.is_empty())
        .map(|word| format!("{word}.{sub}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_word_expands_the_subdomain() {
        let words = vec!["www".to_string(), "mail".to_string(), String::new()];
        assert_eq!(
            brute_names(&words, "dev.example.com"),
            vec!["www.dev.example.com", "mail.dev.example.com"]
        );
    }
}
