use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Engine, Wiring};
use crate::model::Discovery;
use crate::service::Service;
use crate::services::address::AddressService;
use crate::services::alter::AlterationService;
use crate::services::brute::BruteForceService;
use crate::services::cert::ActiveCertService;
use crate::services::data::DataManager;
use crate::services::dns::{self, DnsService};
use crate::services::name::NameService;
use crate::sources::{all_sources, Source, SourceService};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tracing::{info, instrument};

const OUTPUT_QUEUE_CAPACITY: usize = 100;
const QUIESCENCE_TICK_MS: u64 = 3_000;
const DRAIN_GRACE_MS: u64 = 2_000;

/// One DNS enumeration: wires the services together, drives their
/// lifecycle, and closes the output channel on quiescence.
///
/// ```no_run
/// # use enumerator::{Config, Enumeration};
/// # use std::sync::Arc;
/// # async fn run() -> enumerator::Result<()> {
/// let config = Config {
///     domains: vec!["example.com".to_string()],
///     ..Default::default()
/// };
/// let enumeration = Arc::new(Enumeration::new(config));
/// let mut output = enumeration.take_output().expect("output not yet taken");
///
/// let runner = Arc::clone(&enumeration);
/// tokio::spawn(async move { runner.start().await });
///
/// while let Some(discovery) = output.recv().await {
///     println!("{}", discovery.name);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Enumeration {
    config: Mutex<Config>,
    output_tx: Arc<Mutex<Option<mpsc::Sender<Discovery>>>>,
    output_rx: Mutex<Option<mpsc::Receiver<Discovery>>>,
    pause_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    started: AtomicBool,
    extra_sources: Mutex<Vec<Box<dyn Source>>>,
    pub(crate) tick: Duration,
    pub(crate) grace: Duration,
}

impl Enumeration {
    pub fn new(config: Config) -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (pause_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Self {
            config: Mutex::new(config),
            output_tx: Arc::new(Mutex::new(Some(output_tx))),
            output_rx: Mutex::new(Some(output_rx)),
            pause_tx,
            done_tx,
            started: AtomicBool::new(false),
            extra_sources: Mutex::new(Vec::new()),
            tick: Duration::from_millis(QUIESCENCE_TICK_MS),
            grace: Duration::from_millis(DRAIN_GRACE_MS),
        }
    }

    /// The discovery stream. It closes once all services went quiet for a
    /// full tick, or after `done` was signaled. Can be taken once.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Discovery>> {
        self.output_rx.lock().expect("output lock poisoned").take()
    }

    /// Register an additional data source before `start`.
    pub fn add_source(&self, source: Box<dyn Source>) {
        self.extra_sources
            .lock()
            .expect("sources lock poisoned")
            .push(source);
    }

    /// Temporarily halt the engine. In-flight DNS queries are not aborted.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Ask the engine to wind down without waiting for quiescence.
    pub fn done(&self) {
        let _ = self.done_tx.send(true);
    }

    /// Run the enumeration to completion. Validates the configuration,
    /// starts the services and polls their activity flags every tick until
    /// one full tick passes with no work done anywhere.
    #[instrument(name = "enumeration", level = "info", skip_all)]
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let result = self.run().await;
        if result.is_err() {
            // a refused startup still closes the discovery stream
            *self.output_tx.lock().expect("output sender lock poisoned") = None;
        }
        result
    }

    async fn run(&self) -> Result<()> {
        let mut done_rx = self.done_tx.subscribe();
        let mut pause_rx = self.pause_tx.subscribe();

        let mut config = self.config.lock().expect("config lock poisoned").clone();
        config.check()?;
        config.ensure_wordlist().await?;

        let engine = Arc::new(Engine::new(
            config,
            Arc::clone(&self.output_tx),
            self.pause_tx.subscribe(),
            dns::new_resolver(),
        )?);

        // construct every service, then wire the event fan-out
        let name = NameService::new(&engine);
        let addr = AddressService::new(&engine);
        let dns = DnsService::new(&engine);
        let data = DataManager::new(&engine);
        let alter = AlterationService::new(&engine);
        let brute = BruteForceService::new(&engine);
        let cert = ActiveCertService::new(&engine);

        let mut sources: Vec<Arc<SourceService>> = Vec::new();
        if engine.config.default_sources {
            sources.extend(all_sources(&engine)?);
        }
        for source in self.extra_sources.lock().expect("sources lock poisoned").drain(..) {
            sources.push(SourceService::new(&engine, source)?);
        }

        engine.wire(Wiring {
            name_tx: name.base().request_tx(),
            resolved_tx: name.resolved_tx(),
            dns_tx: dns.base().request_tx(),
            subdomain_tx: dns.subdomain_tx(),
            sweep_tx: dns.sweep_tx(),
            addr_tx: addr.base().request_tx(),
            data_tx: data.data_tx(),
            alt_tx: alter.base().request_tx(),
            brute_subdomain_tx: brute.subdomain_tx(),
            cert_tx: cert.base().request_tx(),
            source_txs: sources.iter().map(|s| s.base().request_tx()).collect(),
        });

        // passive mode runs without resolution and without the generators
        let mut services: Vec<Arc<dyn Service>> = Vec::new();
        if !engine.config.passive {
            services.push(dns as Arc<dyn Service>);
            services.push(data as Arc<dyn Service>);
            services.push(cert as Arc<dyn Service>);
        }
        services.push(name as Arc<dyn Service>);
        services.push(addr as Arc<dyn Service>);
        if !engine.config.passive {
            services.push(alter as Arc<dyn Service>);
            services.push(brute as Arc<dyn Service>);
        }
        for source in &sources {
            services.push(Arc::clone(source) as Arc<dyn Service>);
        }

        for service in &services {
            Arc::clone(service).start().await?;
        }
        info!("{:12} - {} services running", "STARTED", services.len());

        // quiescence loop
        let mut ticker = interval(self.tick);
        ticker.tick().await;

        'run: loop {
            tokio::select! {
                _ = done_rx.changed() => break 'run,
                changed = pause_rx.changed() => {
                    if changed.is_err() {
                        break 'run;
                    }
                    if *pause_rx.borrow() {
                        info!("{:12} - engine paused", "PAUSE");
                        // the ticker stops while paused
                        loop {
                            tokio::select! {
                                _ = done_rx.changed() => break 'run,
                                changed = pause_rx.changed() => {
                                    if changed.is_err() || !*pause_rx.borrow() {
                                        break;
                                    }
                                }
                            }
                        }
                        info!("{:12} - engine resumed", "RESUME");
                        ticker = interval(self.tick);
                        ticker.tick().await;
                    }
                }
                _ = ticker.tick() => {
                    let mut idle = true;
                    for service in &services {
                        if service.base().take_active() {
                            idle = false;
                        }
                    }
                    if idle {
                        info!("{:12} - no service reported activity", "QUIESCENT");
                        break 'run;
                    }
                }
            }
        }

        for service in &services {
            service.stop();
        }
        engine.stop_flow();

        // give in-flight emissions a moment to land before closing
        sleep(self.grace).await;
        engine.close_output();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;
    use crate::sources::SourceService;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use tokio::time::timeout;

    struct StaticSource {
        names: Vec<&'static str>,
    }

    #[async_trait]
    impl Source for StaticSource {
        fn name(&self) -> String {
            "MockSource".to_string()
        }

        fn description(&self) -> String {
            "Fixed names for tests".to_string()
        }

        fn tag(&self) -> Tag {
            Tag::Scrape
        }

        async fn execute_query(&self, svc: &SourceService, domain: &str) {
            for name in &self.names {
                svc.emit(domain, name).await;
            }
        }
    }

    fn passive_enumeration(config: Config) -> Arc<Enumeration> {
        let mut enumeration = Enumeration::new(config);
        enumeration.tick = Duration::from_millis(100);
        enumeration.grace = Duration::from_millis(50);
        Arc::new(enumeration)
    }

    fn passive_config() -> Config {
        Config {
            domains: vec!["example.com".to_string()],
            passive: true,
            default_sources: false,
            ..Default::default()
        }
    }

    async fn collect_output(
        enumeration: Arc<Enumeration>,
    ) -> (BTreeSet<String>, Result<()>) {
        let mut output = enumeration.take_output().expect("output already taken");
        let runner = {
            let enumeration = Arc::clone(&enumeration);
            tokio::spawn(async move { enumeration.start().await })
        };

        let mut names = BTreeSet::new();
        while let Some(discovery) = output.recv().await {
            assert_eq!(discovery.tag, Tag::Scrape);
            assert!(discovery.name.ends_with("example.com"));
            names.insert(discovery.name);
        }

        let result = timeout(Duration::from_secs(10), runner)
            .await
            .expect("engine did not reach quiescence")
            .expect("engine task panicked");
        (names, result)
    }

    #[tokio::test]
    async fn passive_run_deduplicates_and_closes_the_output() {
        let enumeration = passive_enumeration(passive_config());
        enumeration.add_source(Box::new(StaticSource {
            names: vec!["a.example.com", "b.example.com", "a.example.com"],
        }));

        let (names, result) = collect_output(enumeration).await;
        result.unwrap();
        assert_eq!(
            names,
            BTreeSet::from(["a.example.com".to_string(), "b.example.com".to_string()])
        );
    }

    #[tokio::test]
    async fn blacklisted_names_are_never_reported() {
        let mut config = passive_config();
        config.blacklist = vec!["bad.example.com".to_string()];

        let enumeration = passive_enumeration(config);
        enumeration.add_source(Box::new(StaticSource {
            names: vec!["bad.example.com", "good.example.com"],
        }));

        let (names, result) = collect_output(enumeration).await;
        result.unwrap();
        assert_eq!(names, BTreeSet::from(["good.example.com".to_string()]));
    }

    #[tokio::test]
    async fn empty_domain_list_terminates_with_no_output() {
        let mut config = passive_config();
        config.domains.clear();

        let enumeration = passive_enumeration(config);
        enumeration.add_source(Box::new(StaticSource {
            names: vec!["a.example.com"],
        }));

        let (names, result) = collect_output(enumeration).await;
        result.unwrap();
        assert!(names.is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume_lose_no_discoveries() {
        let enumeration = passive_enumeration(passive_config());
        enumeration.add_source(Box::new(StaticSource {
            names: vec![
                "a.example.com",
                "b.example.com",
                "c.example.com",
                "d.example.com",
                "e.example.com",
            ],
        }));

        {
            let enumeration = Arc::clone(&enumeration);
            tokio::spawn(async move {
                sleep(Duration::from_millis(30)).await;
                enumeration.pause();
                sleep(Duration::from_millis(150)).await;
                enumeration.resume();
            });
        }

        let (names, result) = collect_output(enumeration).await;
        result.unwrap();
        assert_eq!(names.len(), 5);
    }

    #[tokio::test]
    async fn starting_twice_is_refused() {
        let enumeration = passive_enumeration(passive_config());
        let first = {
            let enumeration = Arc::clone(&enumeration);
            tokio::spawn(async move { enumeration.start().await })
        };

        sleep(Duration::from_millis(20)).await;
        match enumeration.start().await {
            Err(Error::AlreadyStarted) => {}
            other => panic!("expected AlreadyStarted, got {other:?}"),
        }

        enumeration.done();
        timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
