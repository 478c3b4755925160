use crate::error::{Error, Result};
use crate::events::Engine;
use crate::model::{Request, ResolvedName, Tag};
use crate::net;
use crate::service::{pause_point, Service, ServiceBase};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_client::proto::iocompat::AsyncIoTokioAsStd;
use hickory_client::rr::{DNSClass, Name, RecordType};
use hickory_client::tcp::TcpClientStream;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

// timeouts
pub const DNS_QUERY_TIMEOUT_MS: u64 = 2_000;
pub const AXFR_TIMEOUT_MS: u64 = 10_000;

// concurrency numbers
const REVERSE_SWEEP_CONCURRENCY: usize = 50;

const WILDCARD_PROBES: usize = 3;

/// Resolver shared by the engine: 2s per attempt, one retry.
pub fn new_resolver() -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.timeout = Duration::from_millis(DNS_QUERY_TIMEOUT_MS);
    opts.attempts = 2;
    TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
}

// region:        --- Wildcard detection

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WildcardType {
    None,
    Static,
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardRecord {
    pub wildcard_type: WildcardType,
    /// Answer-set fingerprint of a static wildcard, used to mask results.
    pub answers: BTreeSet<String>,
}

/// Per-zone wildcard classification, cached for the run. Untrusted requests
/// in a dynamic zone are dropped outright; answers matching a static
/// fingerprint are masked.
pub struct WildcardFilter {
    resolver: TokioAsyncResolver,
    cache: tokio::sync::Mutex<HashMap<String, WildcardRecord>>,
    probe_seq: AtomicUsize,
}

impl WildcardFilter {
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self {
            resolver,
            cache: tokio::sync::Mutex::new(HashMap::new()),
            probe_seq: AtomicUsize::new(0),
        }
    }

    /// Classify a zone, probing it on first sight.
    pub async fn classification(&self, zone: &str) -> WildcardType {
        let mut cache = self.cache.lock().await;
        if let Some(record) = cache.get(zone) {
            return record.wildcard_type;
        }

        let mut probes = Vec::with_capacity(WILDCARD_PROBES);
        for _ in 0..WILDCARD_PROBES {
            let name = format!("{}.{}", self.probe_label(), zone);
            let answers = {
                let _slot = net::connection_slot().await;
                match self.resolver.lookup_ip(name.as_str()).await {
                    Ok(lookup) => lookup.iter().map(|ip| ip.to_string()).collect(),
                    Err(_) => BTreeSet::new(),
                }
            };
            probes.push(answers);
        }

        let record = classify_probes(&probes);
        if record.wildcard_type != WildcardType::None {
            info!("{:12} - {} ({:?})", "WILDCARD", zone, record.wildcard_type);
        }
        let wildcard_type = record.wildcard_type;
        cache.insert(zone.to_string(), record);
        wildcard_type
    }

    /// True when the answers for an untrusted request are masked by the
    /// zone's wildcard.
    pub async fn matches(&self, zone: &str, answers: &[String]) -> bool {
        if answers.is_empty() {
            return false;
        }
        match self.classification(zone).await {
            WildcardType::None => false,
            WildcardType::Dynamic => true,
            WildcardType::Static => {
                let cache = self.cache.lock().await;
                cache
                    .get(zone)
                    .map(|record| answers.iter().all(|a| record.answers.contains(a)))
                    .unwrap_or(false)
            }
        }
    }

    // a label that cannot collide with a legitimate name
    fn probe_label(&self) -> String {
        let seq = self.probe_seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        format!("a{nanos:x}x{seq}")
    }
}

/// A zone is a static wildcard when every probe resolved to one common
/// answer set, dynamic when probes resolved to differing answers, and clean
/// when any probe failed to resolve.
pub(crate) fn classify_probes(probes: &[BTreeSet<String>]) -> WildcardRecord {
    if probes.is_empty() || probes.iter().any(BTreeSet::is_empty) {
        return WildcardRecord {
            wildcard_type: WildcardType::None,
            answers: BTreeSet::new(),
        };
    }

    if probes.windows(2).all(|pair| pair[0] == pair[1]) {
        WildcardRecord {
            wildcard_type: WildcardType::Static,
            answers: probes[0].clone(),
        }
    } else {
        WildcardRecord {
            wildcard_type: WildcardType::Dynamic,
            answers: BTreeSet::new(),
        }
    }
}

// endregion:     --- Wildcard detection

// region:        --- DNS service

/// Owns all DNS work: resolution, subdomain infrastructure queries, zone
/// transfers and reverse sweeps.
pub struct DnsService {
    base: ServiceBase,
    engine: Arc<Engine>,
    resolver: TokioAsyncResolver,
    subdomain_tx: mpsc::Sender<(Request, usize)>,
    subdomain_rx: Mutex<Option<mpsc::Receiver<(Request, usize)>>>,
    sweep_tx: mpsc::Sender<(String, String)>,
    sweep_rx: Mutex<Option<mpsc::Receiver<(String, String)>>>,
}

impl DnsService {
    pub fn new(engine: &Arc<Engine>) -> Arc<Self> {
        let (subdomain_tx, subdomain_rx) = mpsc::channel(crate::service::REQUEST_QUEUE_CAPACITY);
        let (sweep_tx, sweep_rx) = mpsc::channel(crate::service::REQUEST_QUEUE_CAPACITY);
        Arc::new(Self {
            base: ServiceBase::new("DNS Service", engine.pause_rx()),
            engine: Arc::clone(engine),
            resolver: new_resolver(),
            subdomain_tx,
            subdomain_rx: Mutex::new(Some(subdomain_rx)),
            sweep_tx,
            sweep_rx: Mutex::new(Some(sweep_rx)),
        })
    }

    pub fn subdomain_tx(&self) -> mpsc::Sender<(Request, usize)> {
        self.subdomain_tx.clone()
    }

    pub fn sweep_tx(&self) -> mpsc::Sender<(String, String)> {
        self.sweep_tx.clone()
    }

    /// Resolve one candidate and report its disposition. The flow permit
    /// attached to the request is released here, exactly once.
    async fn resolve_and_report(&self, req: Request) {
        match self.resolve(&req.name).await {
            Ok((cname, addresses)) if !addresses.is_empty() || cname.is_some() => {
                for ip in &addresses {
                    let addr_req = Request::address(ip, &req.domain, req.tag, &req.source);
                    self.engine.new_address_event(addr_req);
                }
                self.engine
                    .resolved_name_event(ResolvedName { req, cname, addresses })
                    .await;
            }
            Ok(_) => debug!("{:12} - {}", "UNRESOLVED", req.name),
            Err(err) => debug!("{:12} - {}: {}", "UNRESOLVED", req.name, err),
        }
        self.engine.release_flow();
    }

    async fn resolve(&self, name: &str) -> Result<(Option<String>, Vec<String>)> {
        let _slot = net::connection_slot().await;

        let cname = self
            .resolver
            .lookup(name, RecordType::CNAME)
            .await
            .ok()
            .and_then(|lookup| {
                lookup
                    .iter()
                    .find_map(|r| r.as_cname().map(|c| trim_fqdn(&c.0.to_utf8())))
            });

        let addresses = match self.resolver.lookup_ip(name).await {
            Ok(lookup) => lookup.iter().map(|ip| ip.to_string()).collect(),
            Err(err) if cname.is_some() => {
                debug!("{:12} - {}: {}", "CNAME ONLY", name, err);
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };

        Ok((cname, addresses))
    }

    /// Infrastructure queries for a freshly seen subdomain: NS, MX and SOA
    /// lookups, plus a zone-transfer attempt against each name server.
    async fn process_subdomain(&self, req: Request, times: usize) {
        if times != 1 {
            return;
        }
        self.base.set_active();

        let ns_hosts = self.record_names(&req.name, RecordType::NS).await;
        for host in &ns_hosts {
            self.emit_name(host, &req).await;
            if let Err(err) = self.zone_transfer(&req.name, &req.domain, host).await {
                debug!("{:12} - {} via {}: {}", "AXFR", req.name, host, err);
            }
        }

        for host in self.record_names(&req.name, RecordType::MX).await {
            self.emit_name(&host, &req).await;
        }
        for host in self.record_names(&req.name, RecordType::SOA).await {
            self.emit_name(&host, &req).await;
        }
    }

    /// Host names carried by the records of one lookup.
    async fn record_names(&self, name: &str, record_type: RecordType) -> Vec<String> {
        let _slot = net::connection_slot().await;
        match self.resolver.lookup(name, record_type).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|r| match record_type {
                    RecordType::NS => r.as_ns().map(|ns| ns.0.to_utf8()),
                    RecordType::MX => r.as_mx().map(|mx| mx.exchange().to_utf8()),
                    RecordType::SOA => r.as_soa().map(|soa| soa.mname().to_utf8()),
                    _ => None,
                })
                .map(|n| trim_fqdn(&n))
                .collect(),
            Err(err) => {
                debug!("{:12} - {} {:?}: {}", "LOOKUP", name, record_type, err);
                Vec::new()
            }
        }
    }

    async fn emit_name(&self, name: &str, origin: &Request) {
        if let Some(domain) = self.engine.config.domain_of(name) {
            let req = Request::name(name, domain, Tag::Dns, &origin.source);
            self.engine.new_name_event(req).await;
        }
    }

    /// Ask a name server for the whole zone. Most servers refuse; the names
    /// of a successful transfer enter the pipeline as trusted requests.
    async fn zone_transfer(&self, zone: &str, domain: &str, ns: &str) -> Result<()> {
        let _slot = net::connection_slot().await;

        let lookup = self.resolver.lookup_ip(ns).await?;
        let Some(ip) = lookup.iter().next() else {
            return Ok(());
        };
        let addr = SocketAddr::new(ip, 53);

        let names = timeout(Duration::from_millis(AXFR_TIMEOUT_MS), async {
            let (stream, sender) = TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(addr);
            let (mut client, bg) = AsyncClient::new(stream, sender, None).await?;
            tokio::spawn(bg);

            let response = client
                .query(Name::from_utf8(zone)?, DNSClass::IN, RecordType::AXFR)
                .await?;

            let names: Vec<String> = response
                .answers()
                .iter()
                .map(|record| trim_fqdn(&record.name().to_utf8()))
                .collect();
            Ok::<_, Error>(names)
        })
        .await
        .map_err(|_| Error::Timeout(format!("AXFR against {ns}")))??;

        if names.is_empty() {
            return Ok(());
        }
        info!("{:12} - {} names for {} via {}", "AXFR", names.len(), zone, ns);
        for name in names {
            if self.engine.config.domain_of(&name).is_some() {
                let req = Request::name(&name, domain, Tag::Axfr, "DNS Zone Transfer");
                self.engine.new_name_event(req).await;
            }
        }
        Ok(())
    }

    /// PTR-query a window of the enclosing prefix around one address.
    async fn reverse_sweep(&self, address: &str, cidr: &str) {
        let targets = match sweep_targets(address, cidr, self.engine.config.max_sweep_hosts) {
            Ok(targets) => targets,
            Err(err) => {
                warn!("{:12} - {} in {}: {}", "SWEEP", address, cidr, err);
                return;
            }
        };

        debug!("{:12} - {} addresses around {}", "SWEEP", targets.len(), address);
        stream::iter(targets)
            .for_each_concurrent(REVERSE_SWEEP_CONCURRENCY, |ip| async move {
                self.base.set_active();
                let ptr_names = {
                    let _slot = net::connection_slot().await;
                    match self.resolver.reverse_lookup(ip).await {
                        Ok(lookup) => lookup
                            .iter()
                            .map(|ptr| trim_fqdn(&ptr.to_string()))
                            .collect(),
                        Err(_) => Vec::new(),
                    }
                };
                for name in ptr_names {
                    if let Some(domain) = self.engine.config.domain_of(&name) {
                        let mut req = Request::name(&name, domain, Tag::Dns, "Reverse DNS");
                        req.address = ip.to_string();
                        self.engine.new_name_event(req).await;
                    }
                }
            })
            .await;
    }
}

#[async_trait]
impl Service for DnsService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        // resolution drain
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
                        let task = Arc::clone(&svc);
                        tokio::spawn(async move { task.resolve_and_report(req).await });
                    }
                }
            }
        });

        // subdomain drain
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
                        let task = Arc::clone(&svc);
                        tokio::spawn(async move { task.process_subdomain(req, times).await });
                    }
                }
            }
        });

        // reverse sweep drain
        let svc = Arc::clone(&self);
        let mut rx = self
            .sweep_rx
            .lock()
            .expect("sweep queue lock poisoned")
            .take()
            .ok_or(Error::AlreadyStarted)?;
        tokio::spawn(async move {
            let mut quit = svc.base.quit_rx();
            let mut pause = svc.base.pause_rx();
            loop {
                pause_point(&mut pause).await;
                tokio::select! {
                    _ = quit.changed() => return,
                    sweep = rx.recv() => {
                        let Some((address, cidr)) = sweep else { return };
                        svc.base.set_active();
                        let task = Arc::clone(&svc);
                        tokio::spawn(async move { task.reverse_sweep(&address, &cidr).await });
                    }
                }
            }
        });

        Ok(())
    }
}

// endregion:     --- DNS service

fn trim_fqdn(name: &str) -> String {
    name.trim_end_matches('.').to_lowercase()
}

/// The sweep window: up to `cap` addresses of the prefix, centered on the
/// address that triggered the sweep. IPv6 prefixes are not swept.
pub(crate) fn sweep_targets(address: &str, cidr: &str, cap: usize) -> Result<Vec<IpAddr>> {
    let net: IpNet = cidr.parse()?;
    let (IpNet::V4(net), Ok(IpAddr::V4(center))) = (net, address.parse::<IpAddr>()) else {
        return Ok(Vec::new());
    };

    let first = u32::from(net.network());
    let last = u32::from(net.broadcast());
    let center = u32::from(center).clamp(first, last);

    let half = (cap as u32) / 2;
    let start = center.saturating_sub(half).max(first);
    let end = center.saturating_add(half).min(last);

    Ok((start..=end)
        .take(cap)
        .map(|raw| IpAddr::V4(Ipv4Addr::from(raw)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_probe_answers_classify_as_static() {
        let probes = vec![answers(&["1.2.3.4"]), answers(&["1.2.3.4"]), answers(&["1.2.3.4"])];
        let record = classify_probes(&probes);
        assert_eq!(record.wildcard_type, WildcardType::Static);
        assert_eq!(record.answers, answers(&["1.2.3.4"]));
    }

    #[test]
    fn varying_probe_answers_classify_as_dynamic() {
        let probes = vec![answers(&["1.2.3.4"]), answers(&["5.6.7.8"]), answers(&["9.9.9.9"])];
        let record = classify_probes(&probes);
        assert_eq!(record.wildcard_type, WildcardType::Dynamic);
    }

    #[test]
    fn unresolved_probes_classify_as_clean() {
        let probes = vec![answers(&["1.2.3.4"]), BTreeSet::new(), answers(&["1.2.3.4"])];
        assert_eq!(classify_probes(&probes).wildcard_type, WildcardType::None);
        assert_eq!(classify_probes(&[]).wildcard_type, WildcardType::None);
    }

    #[tokio::test]
    async fn static_fingerprint_masks_matching_answers_only() {
        let filter = WildcardFilter::new(new_resolver());
        filter.cache.lock().await.insert(
            "wild.test".to_string(),
            WildcardRecord {
                wildcard_type: WildcardType::Static,
                answers: answers(&["1.2.3.4"]),
            },
        );

        assert!(filter.matches("wild.test", &["1.2.3.4".to_string()]).await);
        assert!(!filter.matches("wild.test", &["8.8.8.8".to_string()]).await);
        // a request with no answers is never masked
        assert!(!filter.matches("wild.test", &[]).await);
    }

    #[test]
    fn sweep_window_is_capped_and_centered() {
        let targets = sweep_targets("10.0.0.200", "10.0.0.0/24", 256).unwrap();
        assert!(targets.len() <= 256);
        assert!(targets.contains(&"10.0.0.200".parse().unwrap()));

        let targets = sweep_targets("10.0.128.1", "10.0.0.0/16", 50).unwrap();
        assert_eq!(targets.len(), 50);
        assert!(targets.contains(&"10.0.128.1".parse().unwrap()));
    }

    #[test]
    fn ipv6_prefixes_are_not_swept() {
        let targets = sweep_targets("2001:db8::1", "2001:db8::/64", 256).unwrap();
        assert!(targets.is_empty());
    }
}
