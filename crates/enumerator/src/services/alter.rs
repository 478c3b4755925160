use crate::error::{Error, Result};
use crate::events::Engine;
use crate::model::{Request, Tag};
use crate::service::{pause_point, Service, ServiceBase};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

const ALTERATION_WORDS: &[&str] = &[
    "dev", "test", "staging", "prod", "beta", "new", "old", "api", "int",
];

/// Generates mutations of validated names and feeds them back into the
/// pipeline with the `alt` tag.
pub struct AlterationService {
    base: ServiceBase,
    engine: Arc<Engine>,
}

impl AlterationService {
    pub fn new(engine: &Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Alterations", engine.pause_rx()),
            engine: Arc::clone(engine),
        })
    }
}

#[async_trait]
impl Service for AlterationService {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        let svc = Arc::clone(&self);
        let mut rx = self.base.take_request_rx().ok_or(Error::AlreadyStarted)?;
        tokio::spawn(async move {
            let mut quit = svc.base.quit_rx();
            let mut pause = svc.base.pause_rx();
            loop {
                pause_point(&mut pause).await;
                tokio::select! {
                    _ = quit.changed() => return,
                    req = rx.recv() => {
                        let Some(req) = req else { return };
                        svc.base.set_active();
                        for name in alterations(&req.name, &req.domain) {
                            let alt = Request::name(&name, &req.domain, Tag::Alt, "Alterations");
                            svc.engine.new_name_event(alt).await;
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

/// Mutations of the first label of a name: digit flips, digit append/strip,
/// common prefixes and suffixes, and dictionary substitutions.
pub(crate) fn alterations(name: &str, domain: &str) -> Vec<String> {
    let Some((label, rest)) = name.split_once('.') else {
        return Vec::new();
    };
    // never mutate the root domain itself
    if name == domain || label.is_empty() {
        return Vec::new();
    }

    let mut labels: Vec<String> = Vec::new();

    // flip each digit to its neighbors
    for (i, ch) in label.char_indices() {
        if let Some(d) = ch.to_digit(10) {
            for flipped in [d.checked_sub(1), (d < 9).then_some(d + 1)].into_iter().flatten() {
                let mut alt = label.to_string();
                alt.replace_range(i..i + 1, &flipped.to_string());
                labels.push(alt);
            }
        }
    }

    // append a digit, strip trailing digits
    for n in 1..=2 {
        labels.push(format!("{label}{n}"));
    }
    let stripped = label.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped != label && !stripped.is_empty() {
        labels.push(stripped.to_string());
    }

    // common prefixes and suffixes
    for word in ALTERATION_WORDS {
        labels.push(format!("{word}-{label}"));
        labels.push(format!("{label}-{word}"));
    }

    // dictionary substitutions
    for word in ALTERATION_WORDS {
        if label.contains(word) {
            for replacement in ALTERATION_WORDS {
                if replacement != word {
                    labels.push(label.replace(word, replacement));
                }
            }
        }
    }

    let mut seen = HashSet::new();
    labels
        .into_iter()
        .filter(|l| l != label && seen.insert(l.clone()))
        .map(|l| format!("{l}.{rest}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digits_are_flipped_and_appended() {
        let alts = alterations("web2.example.com", "example.com");
        assert!(alts.contains(&"web1.example.com".to_string()));
        assert!(alts.contains(&"web3.example.com".to_string()));
        assert!(alts.contains(&"web21.example.com".to_string()));
        assert!(alts.contains(&"web.example.com".to_string()));
    }

    #[test]
    fn words_are_attached_and_substituted() {
        let alts = alterations("dev.example.com", "example.com");
        assert!(alts.contains(&"test.example.com".to_string()));
        assert!(alts.contains(&"dev-test.example.com".to_string()));
        assert!(alts.contains(&"staging-dev.example.com".to_string()));
    }

    #[test]
    fn the_original_name_is_never_emitted() {
        let alts = alterations("www1.example.com", "example.com");
        assert!(!alts.contains(&"www1.example.com".to_string()));

        let mut deduped = alts.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), alts.len());
    }

    #[test]
    fn the_root_domain_is_not_mutated() {
        assert!(alterations("example.com", "example.com").is_empty());
    }
}
