use super::{log_query_error, Source, SourceService};
use crate::model::Tag;
use async_trait::async_trait;

/// DNSTable domain listing.
pub struct DnsTable {}

impl DnsTable {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Source for DnsTable {
    fn name(&self) -> String {
        "DNSTable".to_string()
    }

    fn description(&self) -> String {
        "DNS record listings from dnstable.com".to_string()
    }

    fn tag(&self) -> Tag {
        Tag::Scrape
    }

    async fn execute_query(&self, svc: &SourceService, domain: &str) {
        let url = format!("https://dnstable.com/domain/{domain}");
        if let Err(err) = svc.scrape(domain, &url).await {
            log_query_error(&self.name(), &url, &err);
        }
    }
}
