use crate::config::Config;
use crate::error::Result;
use crate::filter::DedupFilter;
use crate::flow::FlowLimiter;
use crate::graph::Graph;
use crate::model::{parent_name, remove_asterisk_label, AddressInfo, Discovery, Request, ResolvedName};
use crate::services::address::AsnCache;
use crate::services::data::DataEvent;
use crate::services::dns::{WildcardFilter, WildcardType};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Channel senders into every running service, installed once the services
/// are constructed and before any of them starts.
pub struct Wiring {
    pub name_tx: mpsc::Sender<Request>,
    pub resolved_tx: mpsc::Sender<ResolvedName>,
    pub dns_tx: mpsc::Sender<Request>,
    pub subdomain_tx: mpsc::Sender<(Request, usize)>,
    pub sweep_tx: mpsc::Sender<(String, String)>,
    pub addr_tx: mpsc::Sender<Request>,
    pub data_tx: mpsc::Sender<DataEvent>,
    pub alt_tx: mpsc::Sender<Request>,
    pub brute_subdomain_tx: mpsc::Sender<(Request, usize)>,
    pub cert_tx: mpsc::Sender<Request>,
    pub source_txs: Vec<mpsc::Sender<Request>>,
}

/// Shared core of one enumeration: configuration, graph, filters, flow
/// limiter and the directed events connecting the services. Every emission
/// runs on its own task so a slow consumer never stalls a producer.
pub struct Engine {
    pub config: Config,
    pub graph: Graph,
    pub asn_cache: AsnCache,
    wildcards: WildcardFilter,
    max_flow: FlowLimiter,
    trusted_filter: DedupFilter,
    other_filter: DedupFilter,
    output_tx: Arc<Mutex<Option<mpsc::Sender<Discovery>>>>,
    pause_rx: watch::Receiver<bool>,
    swept: Mutex<HashSet<String>>,
    wiring: OnceLock<Wiring>,
}

impl Engine {
    pub fn new(
        config: Config,
        output_tx: Arc<Mutex<Option<mpsc::Sender<Discovery>>>>,
        pause_rx: watch::Receiver<bool>,
        resolver: TokioAsyncResolver,
    ) -> Result<Self> {
        let ops_writer: Option<Box<dyn Write + Send>> = match &config.data_ops_path {
            Some(path) => Some(Box::new(File::create(path)?)),
            None => None,
        };
        let max_flow = FlowLimiter::new(config.timing.max_flow(), config.timing.release_interval());

        Ok(Self {
            graph: Graph::new(ops_writer),
            asn_cache: AsnCache::new(resolver.clone()),
            wildcards: WildcardFilter::new(resolver),
            max_flow,
            trusted_filter: DedupFilter::new(),
            other_filter: DedupFilter::new(),
            output_tx,
            pause_rx,
            swept: Mutex::new(HashSet::new()),
            wiring: OnceLock::new(),
            config,
        })
    }

    pub fn wire(&self, wiring: Wiring) {
        if self.wiring.set(wiring).is_err() {
            panic!("engine wired twice");
        }
    }

    fn wiring(&self) -> &Wiring {
        self.wiring.get().expect("engine must be wired before services start")
    }

    /// A watch receiver reflecting the pause state, one per service.
    pub fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause_rx.clone()
    }

    pub fn release_flow(&self) {
        if !self.config.passive {
            self.max_flow.release(1);
        }
    }

    pub fn stop_flow(&self) {
        self.max_flow.stop();
    }

    /// Drop the retained output sender; the channel closes once in-flight
    /// emissions finish.
    pub fn close_output(&self) {
        *self.output_tx.lock().expect("output sender lock poisoned") = None;
    }

    fn spawn_send<T: Send + 'static>(&self, tx: &mpsc::Sender<T>, msg: T) {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(msg).await;
        });
    }

    // region:    --- Events

    /// A newly discovered candidate name. Normalizes, deduplicates within
    /// the trust partition and, outside passive mode, takes one flow permit
    /// before the name enters the pipeline.
    pub async fn new_name_event(&self, mut req: Request) {
        if req.name.is_empty() || req.domain.is_empty() {
            return;
        }
        req.name = remove_asterisk_label(&req.name.to_lowercase()).to_string();
        req.domain = req.domain.to_lowercase();

        // sources occasionally scrape names outside the target domain
        if req.name != req.domain && !req.name.ends_with(&format!(".{}", req.domain)) {
            return;
        }

        let filter = if req.tag.trusted() {
            &self.trusted_filter
        } else {
            &self.other_filter
        };
        if filter.duplicate(&req.name) {
            return;
        }

        if !self.config.passive && self.max_flow.acquire(1).await.is_err() {
            return;
        }
        self.spawn_send(&self.wiring().name_tx, req);
    }

    /// A candidate cleared for resolution. Blacklisted names and untrusted
    /// names in dynamic-wildcard zones are dropped here, their permit
    /// returned.
    pub async fn resolve_name_event(&self, req: Request) {
        if self.config.blacklisted(&req.name) {
            debug!("{:12} - {}", "BLACKLISTED", req.name);
            self.release_flow();
            return;
        }

        if self.config.passive {
            self.resolved_name_event(ResolvedName {
                req,
                cname: None,
                addresses: Vec::new(),
            })
            .await;
            return;
        }

        if !req.tag.trusted() {
            let zone = wildcard_zone(&req);
            if self.wildcards.classification(zone).await == WildcardType::Dynamic {
                debug!("{:12} - {} (dynamic wildcard)", "DROPPED", req.name);
                self.release_flow();
                return;
            }
        }
        self.spawn_send(&self.wiring().dns_tx, req);
    }

    /// A name that resolved. Untrusted answers masked by a static wildcard
    /// fingerprint are suppressed; everything else reaches the name service.
    pub async fn resolved_name_event(&self, resolved: ResolvedName) {
        if !self.config.passive && !resolved.req.tag.trusted() {
            let zone = wildcard_zone(&resolved.req);
            if self.wildcards.matches(zone, &resolved.addresses).await {
                debug!("{:12} - {} (wildcard answers)", "DROPPED", resolved.req.name);
                return;
            }
        }
        self.spawn_send(&self.wiring().resolved_tx, resolved);
    }

    /// Fan a validated name out to everything interested in acting on it.
    pub async fn checked_name_event(&self, resolved: &ResolvedName) {
        let wiring = self.wiring();
        if !self.config.passive {
            self.spawn_send(&wiring.data_tx, DataEvent::Resolved(resolved.clone()));
            if self.config.alterations {
                self.spawn_send(&wiring.alt_tx, resolved.req.clone());
            }
        }
        for tx in &wiring.source_txs {
            self.spawn_send(tx, resolved.req.clone());
        }
    }

    /// A subdomain sighting, with how many times it has been seen.
    pub async fn new_subdomain_event(&self, req: Request, times: usize) {
        if req.name.is_empty() || req.domain.is_empty() {
            return;
        }
        // a CNAME is not a proper subdomain
        if self.graph.cname_of(&req.name).is_some() {
            return;
        }

        if self.config.brute_forcing && self.config.recursive {
            self.spawn_send(&self.wiring().brute_subdomain_tx, (req.clone(), times));
        }
        if !self.config.passive {
            self.spawn_send(&self.wiring().subdomain_tx, (req, times));
        }
    }

    pub fn new_address_event(&self, req: Request) {
        if req.address.is_empty() {
            return;
        }
        self.spawn_send(&self.wiring().addr_tx, req);
    }

    /// Enrichment facts for an address, bound for the graph.
    pub fn address_enriched_event(&self, address: &str, info: &AddressInfo) {
        if self.config.passive {
            return;
        }
        self.spawn_send(
            &self.wiring().data_tx,
            DataEvent::Enriched {
                address: address.to_string(),
                cidr: info.cidr.clone(),
                asn: info.asn,
                description: info.description.clone(),
            },
        );
    }

    /// Schedule a reverse sweep of the prefix enclosing an address. Each
    /// prefix is swept once per run.
    pub fn reverse_dns_sweep_event(&self, address: &str, cidr: &str) {
        if self.config.passive {
            return;
        }
        {
            let mut swept = self.swept.lock().expect("sweep filter lock poisoned");
            if !swept.insert(cidr.to_string()) {
                return;
            }
        }
        self.spawn_send(&self.wiring().sweep_tx, (address.to_string(), cidr.to_string()));
    }

    pub fn active_cert_event(&self, req: Request) {
        if self.config.active {
            self.spawn_send(&self.wiring().cert_tx, req);
        }
    }

    /// Hand a discovery to the caller.
    pub fn output_event(&self, discovery: Discovery) {
        let tx = self
            .output_tx
            .lock()
            .expect("output sender lock poisoned")
            .clone();
        if let Some(tx) = tx {
            tokio::spawn(async move {
                let _ = tx.send(discovery).await;
            });
        }
    }

    // endregion: --- Events
}

/// The zone whose wildcard behavior governs a request: the name's parent,
/// falling back to the root domain for top-level names.
fn wildcard_zone(req: &Request) -> &str {
    match parent_name(&req.name) {
        Some(parent) if parent.ends_with(req.domain.as_str()) => parent,
        _ => &req.domain,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;

    #[test]
    fn wildcard_zone_is_the_parent_within_the_domain() {
        let req = Request::name("x.wild.example.com", "example.com", Tag::Scrape, "test");
        assert_eq!(wildcard_zone(&req), "wild.example.com");

        let req = Request::name("example.com", "example.com", Tag::Scrape, "test");
        assert_eq!(wildcard_zone(&req), "example.com");
    }
}
