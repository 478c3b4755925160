use crate::error::{Error, Result};
use crate::model::Timing;
use crate::net;
use regex::Regex;
use std::path::PathBuf;
use tracing::info;

const DEFAULT_WORDLIST_URL: &str =
    "https://raw.githubusercontent.com/danielmiessler/SecLists/master/Discovery/DNS/subdomains-top1million-5000.txt";

/// Settings for a single enumeration run. Construct with `Config::default()`
/// and override fields before handing it to `Enumeration::new`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root domains to enumerate.
    pub domains: Vec<String>,
    /// Ports probed by the active certificate service.
    pub ports: Vec<u16>,
    /// Labels used by brute forcing; fetched from `wordlist_url` when empty.
    pub wordlist: Vec<String>,
    /// Where the default wordlist is fetched from.
    pub wordlist_url: String,
    /// Names (and their subdomains) that are never resolved or reported.
    pub blacklist: Vec<String>,
    /// Passive mode: no DNS resolution, passive sources only.
    pub passive: bool,
    /// Active mode: pull TLS certificates from discovered hosts.
    pub active: bool,
    pub brute_forcing: bool,
    /// Re-trigger generators when new subdomains are discovered.
    pub recursive: bool,
    /// How many sightings a subdomain needs before recursive expansion.
    pub min_for_recursive: usize,
    /// Generate name alterations from validated names.
    pub alterations: bool,
    pub timing: Timing,
    /// Single HTTP/SOCKS proxy URL applied to all HTTP operations.
    pub proxy: Option<String>,
    /// When set, every graph mutation is mirrored to this file as JSON lines.
    pub data_ops_path: Option<PathBuf>,
    /// Upper bound on addresses queried by one reverse DNS sweep.
    pub max_sweep_hosts: usize,
    /// Start the built-in data sources. Disable to run only sources added
    /// through `Enumeration::add_source`.
    pub default_sources: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            ports: vec![443],
            wordlist: Vec::new(),
            wordlist_url: DEFAULT_WORDLIST_URL.to_string(),
            blacklist: Vec::new(),
            passive: false,
            active: false,
            brute_forcing: false,
            recursive: true,
            min_for_recursive: 1,
            alterations: true,
            timing: Timing::default(),
            proxy: None,
            data_ops_path: None,
            max_sweep_hosts: 256,
            default_sources: true,
        }
    }
}

impl Config {
    /// Sanity-check the configuration and fill in defaults. Startup is
    /// refused on incompatible flags.
    pub fn check(&mut self) -> Result<()> {
        if self.passive && self.brute_forcing {
            return Err(Error::Config(
                "brute forcing cannot be performed without DNS resolution".into(),
            ));
        }
        if self.passive && self.active {
            return Err(Error::Config(
                "active enumeration cannot be performed without DNS resolution".into(),
            ));
        }
        if self.passive && self.data_ops_path.is_some() {
            return Err(Error::Config(
                "data operations cannot be saved without DNS resolution".into(),
            ));
        }
        if self.ports.is_empty() {
            self.ports = vec![443];
        }

        self.domains = self
            .domains
            .iter()
            .map(|d| d.trim().trim_start_matches('.').to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Ok(())
    }

    /// Fetch the default brute-force wordlist when none was supplied.
    pub async fn ensure_wordlist(&mut self) -> Result<()> {
        if !self.brute_forcing || !self.wordlist.is_empty() {
            return Ok(());
        }

        let client = net::http_client(self.proxy.as_deref())?;
        let page = net::fetch_page(&client, &self.wordlist_url).await?;
        self.wordlist = page
            .lines()
            .map(|word| word.trim().to_lowercase())
            .filter(|word| !word.is_empty())
            .collect();

        info!("{:12} - {} words", "WORDLIST", self.wordlist.len());
        Ok(())
    }

    /// True when the name, or a parent of it, was blacklisted.
    pub fn blacklisted(&self, name: &str) -> bool {
        self.blacklist
            .iter()
            .any(|bad| name == bad || name.ends_with(&format!(".{bad}")))
    }

    /// The root domain a name belongs to, if any.
    pub fn domain_of(&self, name: &str) -> Option<&str> {
        self.domains
            .iter()
            .find(|d| name == *d || name.ends_with(&format!(".{d}")))
            .map(String::as_str)
    }

    /// Regex matching any subdomain of `domain` inside a larger text.
    pub fn domain_regex(&self, domain: &str) -> Result<Regex> {
        let pattern = format!(
            r"(?i)(([a-z0-9]|[_a-z0-9][_a-z0-9-]{{0,61}}[a-z0-9])\.)+{}",
            regex::escape(domain)
        );
        Ok(Regex::new(&pattern)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passive_excludes_brute_active_and_data_ops() {
        let mut config = Config {
            passive: true,
            brute_forcing: true,
            ..Default::default()
        };
        assert!(config.check().is_err());

        let mut config = Config {
            passive: true,
            active: true,
            ..Default::default()
        };
        assert!(config.check().is_err());

        let mut config = Config {
            passive: true,
            data_ops_path: Some("ops.json".into()),
            ..Default::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn empty_domain_list_passes_check() {
        let mut config = Config::default();
        assert!(config.check().is_ok());
        assert!(config.domains.is_empty());
    }

    #[test]
    fn empty_ports_fall_back_to_443() {
        let mut config = Config {
            ports: Vec::new(),
            ..Default::default()
        };
        config.check().unwrap();
        assert_eq!(config.ports, vec![443]);
    }

    #[test]
    fn domains_are_normalized() {
        let mut config = Config {
            domains: vec![" Example.COM ".into(), ".other.org".into(), "".into()],
            ..Default::default()
        };
        config.check().unwrap();
        assert_eq!(config.domains, vec!["example.com", "other.org"]);
    }

    #[test]
    fn blacklist_matches_names_and_their_children() {
        let config = Config {
            blacklist: vec!["bad.example.com".into()],
            ..Default::default()
        };
        assert!(config.blacklisted("bad.example.com"));
        assert!(config.blacklisted("deep.bad.example.com"));
        assert!(!config.blacklisted("good.example.com"));
    }

    #[test]
    fn domain_regex_finds_subdomains_in_text() {
        let config = Config::default();
        let re = config.domain_regex("example.com").unwrap();

        let page = r#"<a href="https://www.example.com/x">x</a> api.dev.example.com other.net"#;
        let found: Vec<&str> = re.find_iter(page).map(|m| m.as_str()).collect();
        assert_eq!(found, vec!["www.example.com", "api.dev.example.com"]);
        assert!(!re.is_match("www.other.net"));
    }

    #[test]
    fn domain_of_matches_by_suffix() {
        let config = Config {
            domains: vec!["example.com".into()],
            ..Default::default()
        };
        assert_eq!(config.domain_of("a.example.com"), Some("example.com"));
        assert_eq!(config.domain_of("example.com"), Some("example.com"));
        assert_eq!(config.domain_of("example.net"), None);
        assert_eq!(config.domain_of("notexample.com"), None);
    }
}
