pub mod archive;
pub mod crtsh;
pub mod dnsdumpster;
pub mod dnstable;
pub mod hackertarget;
pub mod netcraft;
pub mod ptrarchive;

use crate::error::{Error, Result};
use crate::events::Engine;
use crate::model::{clean_name, Request, Tag};
use crate::net;
use crate::service::{pause_point, Service, ServiceBase};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;

/// One passive data source. Sources only describe how to query a site; the
/// surrounding `SourceService` owns the tasks, the HTTP client and the
/// activity flag.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> String;
    fn description(&self) -> String;
    fn tag(&self) -> Tag;

    /// Query the site for one root domain, emitting candidates via
    /// `SourceService::emit`.
    async fn execute_query(&self, svc: &SourceService, domain: &str);

    /// Inbound validated names from the pipeline. Most sources have no use
    /// for them and only the activity flag is flipped by the drain; archive
    /// sources override this to crawl the new name.
    async fn handle_request(&self, _svc: &SourceService, _req: &Request) {}
}

/// Generic driver around a `Source`: one task walking the configured root
/// domains, one task draining inbound requests.
pub struct SourceService {
    base: ServiceBase,
    engine: Arc<Engine>,
    source: Box<dyn Source>,
    client: Client,
}

impl SourceService {
    pub fn new(engine: &Arc<Engine>, source: Box<dyn Source>) -> Result<Arc<Self>> {
        let client = net::http_client(engine.config.proxy.as_deref())?;
        Ok(Arc::new(Self {
            base: ServiceBase::new(&source.name(), engine.pause_rx()),
            engine: Arc::clone(engine),
            source,
            client,
        }))
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn set_active(&self) {
        self.base.set_active();
    }

    pub fn quit_rx(&self) -> watch::Receiver<bool> {
        self.base.quit_rx()
    }

    /// Normalize a scraped name and hand it to the engine.
    pub async fn emit(&self, domain: &str, raw: &str) {
        let name = clean_name(raw);
        if name.is_empty() {
            return;
        }
        self.base.set_active();
        let req = Request::name(&name, domain, self.source.tag(), &self.source.name());
        self.engine.new_name_event(req).await;
    }

    /// Fetch a page and emit every subdomain-regex match on it. The shape
    /// shared by all plain scrape sources.
    pub async fn scrape(&self, domain: &str, url: &str) -> Result<()> {
        let page = net::fetch_page(&self.client, url).await?;
        self.set_active();

        let re = self.engine.config.domain_regex(domain)?;
        for found in re.find_iter(&page) {
            self.emit(domain, found.as_str()).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Service for SourceService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        // root-domain driver
        let svc = Arc::clone(&self);
        tokio::spawn(async move {
            let quit = svc.base.quit_rx();
            let mut pause = svc.base.pause_rx();
            for domain in svc.engine.config.domains.clone() {
                pause_point(&mut pause).await;
                if *quit.borrow() {
                    return;
                }
                svc.source.execute_query(&svc, &domain).await;
            }
        });

        // inbound request drain
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
                        svc.source.handle_request(&svc, &req).await;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Every built-in data source, wrapped and ready to start.
pub fn all_sources(engine: &Arc<Engine>) -> Result<Vec<Arc<SourceService>>> {
    let sources: Vec<Box<dyn Source>> = vec![
        Box::new(crtsh::Crtsh::new()),
        Box::new(hackertarget::HackerTarget::new()),
        Box::new(dnstable::DnsTable::new()),
        Box::new(netcraft::Netcraft::new()),
        Box::new(ptrarchive::PtrArchive::new()),
        Box::new(dnsdumpster::DnsDumpster::new()),
        Box::new(archive::wayback()),
        Box::new(archive::archive_it()),
    ];

    sources
        .into_iter()
        .map(|source| SourceService::new(engine, source))
        .collect()
}

/// Log a failed source query the same way everywhere.
pub(crate) fn log_query_error(source: &str, url: &str, err: &Error) {
    error!("{}: {}: {}", source, url, err);
}
