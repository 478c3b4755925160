use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// region:        --- Request tags

/// The kind of source a candidate name came from. Tags decide which dedup
/// partition a name belongs to and whether wildcard filtering applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Dns,
    Cert,
    Archive,
    Axfr,
    Brute,
    Alt,
    Api,
    Scrape,
}

impl Tag {
    /// Trusted tags bypass wildcard filtering and use their own dedup filter.
    pub fn trusted(self) -> bool {
        matches!(self, Tag::Dns | Tag::Cert | Tag::Archive | Tag::Axfr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Dns => "dns",
            Tag::Cert => "cert",
            Tag::Archive => "archive",
            Tag::Axfr => "axfr",
            Tag::Brute => "brute",
            Tag::Alt => "alt",
            Tag::Api => "api",
            Tag::Scrape => "scrape",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// endregion:     --- Request tags

// region:        --- Pipeline messages

/// The unit flowing through the pipeline. Mutated only by normalization at
/// the engine entry point, immutable afterwards.
#[derive(Debug, Clone)]
pub struct Request {
    pub name: String,
    pub domain: String,
    /// Optional IP address, empty when the request carries a name only.
    pub address: String,
    pub tag: Tag,
    pub source: String,
}

impl Request {
    pub fn name(name: &str, domain: &str, tag: Tag, source: &str) -> Self {
        Self {
            name: name.to_string(),
            domain: domain.to_string(),
            address: String::new(),
            tag,
            source: source.to_string(),
        }
    }

    pub fn address(addr: &str, domain: &str, tag: Tag, source: &str) -> Self {
        Self {
            name: String::new(),
            domain: domain.to_string(),
            address: addr.to_string(),
            tag,
            source: source.to_string(),
        }
    }
}

/// A candidate that made it through DNS resolution (or was passed through in
/// passive mode).
#[derive(Debug, Clone)]
pub struct ResolvedName {
    pub req: Request,
    pub cname: Option<String>,
    pub addresses: Vec<String>,
}

// endregion:     --- Pipeline messages

// region:        --- Output records

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressInfo {
    pub ip: String,
    pub cidr: String,
    pub asn: u32,
    pub description: String,
}

/// One validated discovery, emitted at most once per name. Field order is
/// stable for JSON emission.
#[derive(Debug, Clone, Serialize)]
pub struct Discovery {
    pub name: String,
    pub domain: String,
    pub addresses: Vec<AddressInfo>,
    pub tag: Tag,
    pub source: String,
}

// endregion:     --- Output records

// region:        --- Timing templates

/// Speed band for an enumeration, mapping to the flow-limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timing {
    Paranoid,
    Sneaky,
    Polite,
    #[default]
    Normal,
    Aggressive,
    Insane,
}

impl Timing {
    /// Maximum number of names moving through the engine at once.
    pub fn max_flow(self) -> usize {
        match self {
            Timing::Paranoid => 10,
            Timing::Sneaky => 30,
            Timing::Polite => 100,
            Timing::Normal => 333,
            Timing::Aggressive => 1000,
            Timing::Insane => 10000,
        }
    }

    /// Minimum delay between two automatic flow-limiter releases.
    pub fn release_interval(self) -> Duration {
        match self {
            Timing::Paranoid => Duration::from_millis(100),
            Timing::Sneaky => Duration::from_millis(33),
            Timing::Polite => Duration::from_millis(10),
            Timing::Normal => Duration::from_millis(3),
            Timing::Aggressive => Duration::from_millis(1),
            Timing::Insane => Duration::from_micros(100),
        }
    }
}

// endregion:     --- Timing templates

// region:        --- Name normalization

/// Clean up a name scraped from the web: strip leading URL-encoded noise,
/// trim, lowercase, and drop one leading dot.
pub fn clean_name(name: &str) -> String {
    let name = name.trim();
    let stripped = match regex!("^((20)|(25)|(2f)|(3d)|(40))+").find(name) {
        Some(m) => &name[m.end()..],
        None => name,
    };

    let mut name = stripped.trim().to_lowercase();
    if name.len() > 1 && name.starts_with('.') {
        name.remove(0);
    }
    name
}

/// Remove wildcard labels from the front of a DNS name.
pub fn remove_asterisk_label(name: &str) -> &str {
    match name.rfind("*.") {
        Some(idx) => &name[idx + 2..],
        None => name,
    }
}

/// The label-stripped parent of a name, e.g. `a.b.example.com` -> `b.example.com`.
pub fn parent_name(name: &str) -> Option<&str> {
    name.split_once('.').map(|(_, rest)| rest)
}

// endregion:     --- Name normalization

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_tag_partition() {
        for tag in [Tag::Dns, Tag::Cert, Tag::Archive, Tag::Axfr] {
            assert!(tag.trusted());
        }
        for tag in [Tag::Brute, Tag::Alt, Tag::Api, Tag::Scrape] {
            assert!(!tag.trusted());
        }
    }

    #[test]
    fn clean_name_strips_encoded_noise() {
        assert_eq!(clean_name("2520www.example.com"), "www.example.com");
        assert_eq!(clean_name("40mail.example.com"), "mail.example.com");
        assert_eq!(clean_name("  WWW.Example.COM "), "www.example.com");
        assert_eq!(clean_name(".example.com"), "example.com");
        assert_eq!(clean_name("plain.example.com"), "plain.example.com");
    }

    #[test]
    fn asterisk_labels_are_removed() {
        assert_eq!(remove_asterisk_label("*.example.com"), "example.com");
        assert_eq!(remove_asterisk_label("*.*.example.com"), "example.com");
        assert_eq!(remove_asterisk_label("www.example.com"), "www.example.com");
    }

    #[test]
    fn parent_of_name() {
        assert_eq!(parent_name("a.b.example.com"), Some("b.example.com"));
        assert_eq!(parent_name("com"), None);
    }

    #[test]
    fn timing_table_is_fixed() {
        assert_eq!(Timing::Paranoid.max_flow(), 10);
        assert_eq!(Timing::Paranoid.release_interval(), Duration::from_millis(100));
        assert_eq!(Timing::Normal.max_flow(), 333);
        assert_eq!(Timing::Normal.release_interval(), Duration::from_millis(3));
        assert_eq!(Timing::Insane.max_flow(), 10000);
        assert_eq!(Timing::Insane.release_interval(), Duration::from_micros(100));
    }

    #[test]
    fn discovery_serializes_with_stable_field_order() {
        let d = Discovery {
            name: "www.example.com".to_string(),
            domain: "example.com".to_string(),
            addresses: Vec::new(),
            tag: Tag::Scrape,
            source: "DNSTable".to_string(),
        };
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(
            json,
            r#"{"name":"www.example.com","domain":"example.com","addresses":[],"tag":"scrape","source":"DNSTable"}"#
        );
    }
}
