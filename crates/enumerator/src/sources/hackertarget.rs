use super::{log_query_error, Source, SourceService};
use crate::model::Tag;
use crate::net;
use async_trait::async_trait;

/// HackerTarget host-search API, answering `name,ip` CSV lines.
pub struct HackerTarget {}

impl HackerTarget {
    pub fn new() -> Self {
        Self {}
    }

    fn url(domain: &str) -> String {
        format!("https://api.hackertarget.com/hostsearch/?q={domain}")
    }
}

#[async_trait]
impl Source for HackerTarget {
    fn name(&self) -> String {
        "HackerTarget".to_string()
    }

    fn description(&self) -> String {
        "HackerTarget host search API".to_string()
    }

    fn tag(&self) -> Tag {
        Tag::Api
    }

    async fn execute_query(&self, svc: &SourceService, domain: &str) {
        let url = Self::url(domain);
        let page = match net::fetch_page(svc.client(), &url).await {
            Ok(page) => page,
            Err(err) => return log_query_error(&self.name(), &url, &err),
        };
        svc.set_active();

        for name in parse_hosts(&page) {
            svc.emit(domain, &name).await;
        }
    }
}

pub(crate) fn parse_hosts(page: &str) -> Vec<String> {
    page.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("error"))
        .filter_map(|line| line.split(',').next())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_lines_yield_the_host_column() {
        let page = "www.example.com,93.184.216.34\nmail.example.com,93.184.216.35\n\nerror check your search query\n";
        assert_eq!(parse_hosts(page), vec!["www.example.com", "mail.example.com"]);
    }
}
