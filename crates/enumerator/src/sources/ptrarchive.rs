use super::{log_query_error, Source, SourceService};
use crate::model::Tag;
use async_trait::async_trait;

/// PTRArchive reverse-DNS history search.
pub struct PtrArchive {}

impl PtrArchive {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Source for PtrArchive {
    fn name(&self) -> String {
        "PTRArchive".to_string()
    }

    fn description(&self) -> String {
        "Historical PTR records from ptrarchive.com".to_string()
    }

    fn tag(&self) -> Tag {
        Tag::Scrape
    }

    async fn execute_query(&self, svc: &SourceService, domain: &str) {
        let url = format!("http://ptrarchive.com/tools/search3.htm?label={domain}&date=ALL");
        if let Err(err) = svc.scrape(domain, &url).await {
            log_query_error(&self.name(), &url, &err);
        }
    }
}
