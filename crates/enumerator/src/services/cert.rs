use crate::error::{Error, Result};
use crate::events::Engine;
use crate::model::{clean_name, Request, Tag};
use crate::net;
use crate::service::{pause_point, Service, ServiceBase};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

pub const TLS_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Pulls the TLS certificate from `name:port` for each configured port and
/// mines the SAN and CN entries for new names. Certificate chains are not
/// verified, the certificates are only a source of names.
pub struct ActiveCertService {
    base: ServiceBase,
    engine: Arc<Engine>,
}

impl ActiveCertService {
    pub fn new(engine: &Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            base: ServiceBase::new("Active Cert", engine.pause_rx()),
            engine: Arc::clone(engine),
        })
    }

    async fn pull_certificates(&self, req: Request) {
        for port in self.engine.config.ports.clone() {
            let names = match pull_cert(&req.name, port).await {
                Ok(names) => names,
                Err(err) => {
                    debug!("{:12} - {}:{}: {}", "TLS", req.name, port, err);
                    continue;
                }
            };
            self.base.set_active();

            for raw in names {
                let name = clean_name(&raw);
                if let Some(domain) = self.engine.config.domain_of(&name) {
                    let new = Request::name(&name, domain, Tag::Cert, "Active Cert");
                    self.engine.new_name_event(new).await;
                }
            }
        }
    }
}

#[async_trait]
impl Service for ActiveCertService {
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
                        let task = Arc::clone(&svc);
                        tokio::spawn(async move { task.pull_certificates(req).await });
                    }
                }
            }
        });

        Ok(())
    }
}

async fn pull_cert(host: &str, port: u16) -> Result<Vec<String>> {
    let _slot = net::connection_slot().await;
    let handshake = Duration::from_millis(TLS_HANDSHAKE_TIMEOUT_MS);

    let stream = timeout(handshake, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Timeout(format!("connect {host}:{port}")))??;

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let tls = timeout(handshake, connector.connect(host, stream))
        .await
        .map_err(|_| Error::Timeout(format!("handshake {host}:{port}")))??;

    let Some(cert) = tls.get_ref().peer_certificate()? else {
        return Ok(Vec::new());
    };
    Ok(names_from_der(&cert.to_der()?))
}

/// SAN DNS entries and subject CNs of a DER-encoded certificate.
pub(crate) fn names_from_der(der: &[u8]) -> Vec<String> {
    let Ok((_, cert)) = X509Certificate::from_der(der) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                names.push(dns.to_string());
            }
        }
    }
    for attr in cert.subject().iter_common_name() {
        if let Ok(cn) = attr.as_str() {
            names.push(cn.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_certificates_yield_no_names() {
        assert!(names_from_der(&[]).is_empty());
        assert!(names_from_der(&[0x30, 0x03, 0x02, 0x01, 0x01]).is_empty());
    }
}
