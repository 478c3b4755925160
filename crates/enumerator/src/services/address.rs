use crate::error::{Error, Result};
use crate::events::Engine;
use crate::model::AddressInfo;
use crate::net;
use crate::service::{pause_point, Service, ServiceBase};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

// region:        --- ASN cache

#[derive(Debug, Clone)]
pub struct AsnInfo {
    pub asn: u32,
    pub prefix: IpNet,
    pub description: String,
}

/// IP to (CIDR, ASN, description) enrichment over the Team Cymru DNS zones,
/// cached per announced prefix.
pub struct AsnCache {
    resolver: TokioAsyncResolver,
    cache: tokio::sync::Mutex<Vec<AsnInfo>>,
}

impl AsnCache {
    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self {
            resolver,
            cache: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Enrich one address. Lookup failures degrade to a bare record, they
    /// never block the pipeline.
    pub async fn enrich(&self, ip: &str) -> AddressInfo {
        let bare = AddressInfo {
            ip: ip.to_string(),
            cidr: String::new(),
            asn: 0,
            description: String::new(),
        };

        let Ok(addr) = ip.parse::<IpAddr>() else {
            return bare;
        };

        {
            let cache = self.cache.lock().await;
            if let Some(info) = cache.iter().find(|info| info.prefix.contains(&addr)) {
                return filled(ip, info);
            }
        }

        match self.lookup(addr).await {
            Ok(info) => {
                let out = filled(ip, &info);
                self.cache.lock().await.push(info);
                out
            }
            Err(err) => {
                debug!("{:12} - {}: {}", "ASN LOOKUP", ip, err);
                bare
            }
        }
    }

    async fn lookup(&self, addr: IpAddr) -> Result<AsnInfo> {
        let _slot = net::connection_slot().await;

        let origin = origin_query_name(addr);
        let lookup = self.resolver.txt_lookup(origin).await?;
        let line = lookup
            .iter()
            .next()
            .map(|txt| txt.to_string())
            .ok_or_else(|| Error::Parse(format!("no origin record for {addr}")))?;
        let (asn, prefix) = parse_origin_txt(&line)
            .ok_or_else(|| Error::Parse(format!("malformed origin record: {line}")))?;

        let description = match self.resolver.txt_lookup(format!("AS{asn}.asn.cymru.com.")).await {
            Ok(lookup) => lookup
                .iter()
                .next()
                .map(|txt| parse_asn_description(&txt.to_string()))
                .unwrap_or_default(),
            Err(_) => String::new(),
        };

        Ok(AsnInfo {
            asn,
            prefix,
            description,
        })
    }
}

fn filled(ip: &str, info: &AsnInfo) -> AddressInfo {
    AddressInfo {
        ip: ip.to_string(),
        cidr: info.prefix.to_string(),
        asn: info.asn,
        description: info.description.clone(),
    }
}

fn origin_query_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.origin.asn.cymru.com.", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut nibbles = String::new();
            for octet in v6.octets().iter().rev() {
                nibbles.push_str(&format!("{:x}.{:x}.", octet & 0xf, octet >> 4));
            }
            format!("{nibbles}origin6.asn.cymru.com.")
        }
    }
}

/// `"23028 | 216.90.108.0/24 | US | arin | 1998-09-25"`
pub(crate) fn parse_origin_txt(line: &str) -> Option<(u32, IpNet)> {
    let mut parts = line.split('|').map(str::trim);
    let asn = parts.next()?.split_whitespace().next()?.parse().ok()?;
    let prefix = parts.next()?.parse().ok()?;
    Some((asn, prefix))
}

/// `"23028 | US | arin | 2002-01-04 | TEAM-CYMRU, US"`
pub(crate) fn parse_asn_description(line: &str) -> String {
    line.rsplit('|').next().map(str::trim).unwrap_or("").to_string()
}

// endregion:     --- ASN cache

// region:        --- Address service

/// Enriches every newly seen address and schedules the reverse sweep of its
/// announced prefix.
pub struct AddressService {
    base: ServiceBase,
    engine: Arc<Engine>,
}

impl AddressService {
    pub fn new(engine: &Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Address Service", engine.pause_rx()),
            engine: Arc::clone(engine),
        })
    }
}

#[async_trait]
impl Service for AddressService {
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

                        let info = svc.engine.asn_cache.enrich(&req.address).await;
                        if info.cidr.is_empty() {
                            continue;
                        }
                        svc.engine.address_enriched_event(&req.address, &info);
                        svc.engine.reverse_dns_sweep_event(&req.address, &info.cidr);
                    }
                }
            }
        });

        Ok(())
    }
}

// endregion:     --- Address service

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_records_parse_into_asn_and_prefix() {
        let parsed = parse_origin_txt("23028 | 216.90.108.0/24 | US | arin | 1998-09-25");
        let (asn, prefix) = parsed.unwrap();
        assert_eq!(asn, 23028);
        assert_eq!(prefix.to_string(), "216.90.108.0/24");

        // multi-origin answers carry several ASNs, the first one wins
        let parsed = parse_origin_txt("64496 64497 | 192.0.2.0/24 | EU | ripencc | 2001-06-01");
        assert_eq!(parsed.unwrap().0, 64496);

        assert!(parse_origin_txt("garbage").is_none());
    }

    #[test]
    fn asn_records_parse_into_a_description() {
        let desc = parse_asn_description("23028 | US | arin | 2002-01-04 | TEAM-CYMRU, US");
        assert_eq!(desc, "TEAM-CYMRU, US");
    }

    #[test]
    fn origin_query_names_reverse_the_address() {
        assert_eq!(
            origin_query_name("216.90.108.31".parse().unwrap()),
            "31.108.90.216.origin.asn.cymru.com."
        );
        assert!(origin_query_name("2001:db8::1".parse().unwrap()).ends_with("origin6.asn.cymru.com."));
    }
}
