//! Network reachability check done before talking to the backend

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Url;
use tokio::net::TcpStream;

/// Default connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub trait Reachability: Send + Sync {
    fn is_online(&self) -> BoxFuture<'_, bool>;
}

/// Considers the network up when a TCP connection to the backend host succeeds
#[derive(Debug, Clone)]
pub struct TcpReachability {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpReachability {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Check the host of a backend base URL. `None` if the URL has no host.
    pub fn for_base_url(base_url: &str, timeout: Duration) -> Option<Self> {
        let url = Url::parse(base_url).ok()?;
        let host = url.host_str()?.trim_matches(['[', ']']).to_string();
        let port = url.port_or_known_default()?;
        Some(Self::new(host, port, timeout))
    }
}

impl Reachability for TcpReachability {
    fn is_online(&self) -> BoxFuture<'_, bool> {
        async move {
            let connect = TcpStream::connect((self.host.as_str(), self.port));
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    tracing::debug!("Backend {}:{} unreachable: {}", self.host, self.port, e);
                    false
                }
                Err(_) => {
                    tracing::debug!("Backend {}:{} connect timed out", self.host, self.port);
                    false
                }
            }
        }
        .boxed()
    }
}

/// Fixed answer, for tests and for skipping the check
#[derive(Debug, Clone, Copy)]
pub struct StaticReachability(pub bool);

impl Reachability for StaticReachability {
    fn is_online(&self) -> BoxFuture<'_, bool> {
        futures::future::ready(self.0).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_target_from_base_url() {
        let target = TcpReachability::for_base_url("https://backend.example/api", CONNECT_TIMEOUT).unwrap();
        assert_eq!(target.host, "backend.example");
        assert_eq!(target.port, 443);

        let target = TcpReachability::for_base_url("http://127.0.0.1:9290", CONNECT_TIMEOUT).unwrap();
        assert_eq!(target.port, 9290);

        assert!(TcpReachability::for_base_url("not a url", CONNECT_TIMEOUT).is_none());
    }

    #[tokio::test]
    async fn test_open_port_is_online() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let target = TcpReachability::new("127.0.0.1", port, CONNECT_TIMEOUT);
        assert!(target.is_online().await);
    }

    #[tokio::test]
    async fn test_closed_port_is_offline() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let target = TcpReachability::new("127.0.0.1", port, CONNECT_TIMEOUT);
        assert!(!target.is_online().await);
    }

    #[tokio::test]
    async fn test_static_reachability() {
        assert!(StaticReachability(true).is_online().await);
        assert!(!StaticReachability(false).is_online().await);
    }
}
