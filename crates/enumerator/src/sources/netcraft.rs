use super::{log_query_error, Source, SourceService};
use crate::model::Tag;
use async_trait::async_trait;

/// Netcraft site search.
pub struct Netcraft {}

impl Netcraft {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Source for Netcraft {
    fn name(&self) -> String {
        "Netcraft".to_string()
    }

    fn description(&self) -> String {
        "Site reports from searchdns.netcraft.com".to_string()
    }

    fn tag(&self) -> Tag {
        Tag::Scrape
    }

    async fn execute_query(&self, svc: &SourceService, domain: &str) {
        let url = format!("https://searchdns.netcraft.com/?restriction=site+ends+with&host={domain}");
        if let Err(err) = svc.scrape(domain, &url).await {
            log_query_error(&self.name(), &url, &err);
        }
    }
}
