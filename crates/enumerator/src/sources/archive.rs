use super::{Source, SourceService};
use crate::crawler;
use crate::model::{Request, Tag};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::error;

/// A web-archive mirror crawled for historical links. Unlike the plain
/// scrape sources, inbound validated names are crawled too, each name once.
pub struct WebArchive {
    name: &'static str,
    base: &'static str,
    crawled: Mutex<HashSet<String>>,
}

pub fn wayback() -> WebArchive {
    WebArchive::new("Wayback", "http://web.archive.org/web")
}

pub fn archive_it() -> WebArchive {
    WebArchive::new("ArchiveIt", "https://wayback.archive-it.org/all")
}

impl WebArchive {
    fn new(name: &'static str, base: &'static str) -> Self {
        Self {
            name,
            base,
            crawled: Mutex::new(HashSet::new()),
        }
    }

    async fn crawl_name(&self, svc: &SourceService, domain: &str, sub: &str) {
        {
            let mut crawled = self.crawled.lock().expect("crawl filter lock poisoned");
            if !crawled.insert(sub.to_string()) {
                return;
            }
        }

        let re = match svc.engine().config.domain_regex(domain) {
            Ok(re) => re,
            Err(err) => return error!("{}: {}", self.name, err),
        };

        match crawler::crawl(svc.client(), &re, self.base, sub, svc.quit_rx()).await {
            Ok(names) => {
                svc.set_active();
                for name in names {
                    svc.emit(domain, &name).await;
                }
            }
            Err(err) => error!("{}: {}: {}", self.name, self.base, err),
        }
    }
}

#[async_trait]
impl Source for WebArchive {
    fn name(&self) -> String {
        self.name.to_string()
    }

    fn description(&self) -> String {
        format!("Historical links crawled from {}", self.base)
    }

    fn tag(&self) -> Tag {
        Tag::Archive
    }

    async fn execute_query(&self, svc: &SourceService, domain: &str) {
        self.crawl_name(svc, domain, domain).await;
    }

    async fn handle_request(&self, svc: &SourceService, req: &Request) {
        self.crawl_name(svc, &req.domain, &req.name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_name_is_crawled_once() {
        let archive = wayback();
        assert!(archive.crawled.lock().unwrap().insert("example.com".to_string()));
        assert!(!archive.crawled.lock().unwrap().insert("example.com".to_string()));
    }
}
