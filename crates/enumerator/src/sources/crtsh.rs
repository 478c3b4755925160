use super::{log_query_error, Source, SourceService};
use crate::model::Tag;
use crate::net;
use async_trait::async_trait;
use serde::Deserialize;

/// Certificate transparency logs via crt.sh.
pub struct Crtsh {}

#[derive(Debug, Deserialize)]
pub struct CrtshEntry {
    pub name_value: String,
}

impl Crtsh {
    pub fn new() -> Self {
        Self {}
    }

    fn url(domain: &str) -> String {
        format!("https://crt.sh/?q=%25.{domain}&output=json")
    }
}

#[async_trait]
impl Source for Crtsh {
    fn name(&self) -> String {
        "Crtsh".to_string()
    }

    fn description(&self) -> String {
        "Certificate transparency log search via crt.sh".to_string()
    }

    fn tag(&self) -> Tag {
        Tag::Cert
    }

    async fn execute_query(&self, svc: &SourceService, domain: &str) {
        let url = Self::url(domain);
        let page = match net::fetch_page(svc.client(), &url).await {
            Ok(page) => page,
            Err(err) => return log_query_error(&self.name(), &url, &err),
        };
        svc.set_active();

        let entries: Vec<CrtshEntry> = match serde_json::from_str(&page) {
            Ok(entries) => entries,
            Err(err) => return log_query_error(&self.name(), &url, &err.into()),
        };

        for entry in entries {
            for name in entry.name_value.lines() {
                svc.emit(domain, name).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_parse_from_the_json_shape() {
        let page = r#"[
            {"issuer_ca_id":1,"name_value":"www.example.com\n*.example.com"},
            {"name_value":"mail.example.com"}
        ]"#;
        let entries: Vec<CrtshEntry> = serde_json::from_str(page).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].name_value.lines().collect::<Vec<_>>(),
            vec!["www.example.com", "*.example.com"]
        );
    }
}
