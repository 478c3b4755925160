use super::{log_query_error, Source, SourceService};
use crate::model::Tag;
use crate::net;
use async_trait::async_trait;
use lazy_regex::regex;
use tracing::error;

const DNSDUMPSTER_URL: &str = "https://dnsdumpster.com/";

/// DNSDumpster search. The site wants a CSRF token from its landing page
/// echoed back in both the form and a cookie.
pub struct DnsDumpster {}

impl DnsDumpster {
    pub fn new() -> Self {
        Self {}
    }

    async fn post_form(&self, svc: &SourceService, token: &str, domain: &str) -> crate::Result<String> {
        let _slot = net::connection_slot().await;

        let res = svc
            .client()
            .post(DNSDUMPSTER_URL)
            .header("Referer", DNSDUMPSTER_URL)
            .header("Cookie", format!("csrftoken={token}"))
            .header("X-CSRF-Token", token)
            .form(&[("csrfmiddlewaretoken", token), ("targetip", domain)])
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(crate::Error::InvalidHttpResponse(DNSDUMPSTER_URL.to_string()));
        }
        Ok(res.text().await?)
    }
}

#[async_trait]
impl Source for DnsDumpster {
    fn name(&self) -> String {
        "DNSDumpster".to_string()
    }

    fn description(&self) -> String {
        "Domain research via dnsdumpster.com".to_string()
    }

    fn tag(&self) -> Tag {
        Tag::Scrape
    }

    async fn execute_query(&self, svc: &SourceService, domain: &str) {
        let page = match net::fetch_page(svc.client(), DNSDUMPSTER_URL).await {
            Ok(page) => page,
            Err(err) => return log_query_error(&self.name(), DNSDUMPSTER_URL, &err),
        };

        let Some(token) = csrf_token(&page) else {
            error!("{}: failed to obtain the CSRF token", self.name());
            return;
        };
        svc.set_active();

        let page = match self.post_form(svc, &token, domain).await {
            Ok(page) => page,
            Err(err) => return log_query_error(&self.name(), DNSDUMPSTER_URL, &err),
        };
        svc.set_active();

        let re = match svc.engine().config.domain_regex(domain) {
            Ok(re) => re,
            Err(err) => return log_query_error(&self.name(), DNSDUMPSTER_URL, &err),
        };
        for found in re.find_iter(&page) {
            svc.emit(domain, found.as_str()).await;
        }
    }
}

pub(crate) fn csrf_token(page: &str) -> Option<String> {
    regex!("name='csrfmiddlewaretoken' value='([a-zA-Z0-9]*)'")
        .captures(page)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_csrf_token_is_lifted_from_the_landing_page() {
        let page = "<form><input type='hidden' name='csrfmiddlewaretoken' value='Ab12Cd34' /></form>";
        assert_eq!(csrf_token(page).as_deref(), Some("Ab12Cd34"));
        assert!(csrf_token("<form></form>").is_none());
    }
}
