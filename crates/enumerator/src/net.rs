use crate::error::{Error, Result};
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument};

// timeouts
pub const HTTP_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const HTTP_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                              (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

static MAX_CONNECTIONS: OnceLock<Semaphore> = OnceLock::new();

/// Process-wide semaphore guarding every outbound socket, sized to 90% of
/// the file-descriptor soft limit.
pub fn max_connections() -> &'static Semaphore {
    MAX_CONNECTIONS.get_or_init(|| Semaphore::new(file_descriptor_budget()))
}

/// Hold a connection slot for the lifetime of one outbound socket.
pub async fn connection_slot() -> SemaphorePermit<'static> {
    max_connections()
        .acquire()
        .await
        .expect("connection semaphore is never closed")
}

fn file_descriptor_budget() -> usize {
    let soft = rlimit::getrlimit(rlimit::Resource::NOFILE)
        .map(|(soft, _hard)| soft)
        .unwrap_or(1024);
    ((soft / 10) * 9) as usize
}

/// Build the shared HTTP client: fixed user agent, 10s total timeout, 5s
/// connect timeout, optional proxy applied to every request.
pub fn http_client(proxy: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(Duration::from_millis(HTTP_REQUEST_TIMEOUT_MS))
        .connect_timeout(Duration::from_millis(HTTP_HANDSHAKE_TIMEOUT_MS))
        .user_agent(USER_AGENT)
        .cookie_store(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    Ok(builder.build()?)
}

/// GET a page as text, holding a connection slot for the duration.
#[instrument(name = "HTTP_request", level = "debug", skip_all, fields(url = url))]
pub async fn fetch_page(client: &Client, url: &str) -> Result<String> {
    let _slot = connection_slot().await;

    let res = client.get(url).send().await?;
    debug!("{:12} - status {}", "HTTP", res.status());

    if !res.status().is_success() {
        return Err(Error::InvalidHttpResponse(url.to_string()));
    }
    Ok(res.text().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_budget_is_ninety_percent_of_the_soft_limit() {
        let budget = file_descriptor_budget();
        assert!(budget > 0);
        if let Ok((soft, _)) = rlimit::getrlimit(rlimit::Resource::NOFILE) {
            assert_eq!(budget, ((soft / 10) * 9) as usize);
        }
    }

    #[test]
    fn client_builds_with_and_without_proxy() {
        assert!(http_client(None).is_ok());
        assert!(http_client(Some("socks5://127.0.0.1:9050")).is_ok());
        assert!(http_client(Some("not a url")).is_err());
    }
}
