use crate::error::{Error, Result};
use crate::net;
use chrono::{Datelike, Utc};
use regex::Regex;
use reqwest::{Client, Url};
use select::document::Document;
use select::predicate::Name;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::debug;

// the crawl gives up after this long without finding anything new
pub const CRAWL_IDLE_TIMEOUT_MS: u64 = 10_000;
pub const CRAWL_DELAY_MS: u64 = 1_000;

/// Bounded BFS over an archive mirror, seeded with `base/<year>/<sub>`.
///
/// Every link whose URL matches the subdomain regex contributes a name and
/// is enqueued once. The crawl ends when the queue drains, when the idle
/// timer fires, or when the owning service signals quit.
pub async fn crawl(
    client: &Client,
    re: &Regex,
    base: &str,
    sub: &str,
    mut quit: watch::Receiver<bool>,
) -> Result<Vec<String>> {
    let seed = format!("{}/{}/{}", base, Utc::now().year(), sub);
    let seed = Url::parse(&seed).map_err(|err| Error::Parse(format!("crawl seed {seed}: {err}")))?;

    let mut queue = VecDeque::from([seed.clone()]);
    let mut visited: HashSet<String> = HashSet::from([seed.to_string()]);
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut names = Vec::new();

    let idle = Duration::from_millis(CRAWL_IDLE_TIMEOUT_MS);
    let mut last_progress = Instant::now();

    while let Some(url) = queue.pop_front() {
        if *quit.borrow() || last_progress.elapsed() >= idle {
            break;
        }

        let page = tokio::select! {
            _ = quit.changed() => break,
            page = net::fetch_page(client, url.as_str()) => match page {
                Ok(page) => page,
                Err(err) => {
                    debug!("{:12} - {}: {}", "CRAWL", url, err);
                    continue;
                }
            },
        };

        let (page_names, links) = links_and_names(&page, &url, re);
        if !page_names.is_empty() || !links.is_empty() {
            last_progress = Instant::now();
        }

        for name in page_names {
            if seen_names.insert(name.clone()) {
                names.push(name);
            }
        }
        for link in links {
            if visited.insert(link.to_string()) {
                queue.push_back(link);
            }
        }

        sleep(Duration::from_millis(CRAWL_DELAY_MS)).await;
    }

    Ok(names)
}

/// Extract `<a href>` targets from a page: names matched by the subdomain
/// regex and the URLs to crawl next.
pub(crate) fn links_and_names(page: &str, base: &Url, re: &Regex) -> (Vec<String>, Vec<Url>) {
    let document = Document::from(page);
    let mut names = Vec::new();
    let mut links = Vec::new();

    for node in document.find(Name("a")) {
        let Some(href) = node.attr("href") else { continue };
        let Ok(url) = base.join(href) else { continue };

        if let Some(found) = re.find(url.as_str()) {
            names.push(found.as_str().to_string());
            links.push(url);
        }
    }

    (names, links)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn relative_links_resolve_and_matching_names_are_extracted() {
        let base = Url::parse("https://archive.test/2026/example.com").unwrap();
        let re = Config::default().domain_regex("example.com").unwrap();

        let page = r#"
            <html><body>
            <a href="/2026/www.example.com/page">one</a>
            <a href="https://mirror.test/api.example.com">two</a>
            <a href="https://unrelated.net/else">three</a>
            <a>no href</a>
            </body></html>
        "#;

        let (names, links) = links_and_names(page, &base, &re);
        assert_eq!(names, vec!["www.example.com", "api.example.com"]);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].as_str(), "https://archive.test/2026/www.example.com/page");
    }
}
