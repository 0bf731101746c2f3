// Connectivity probes used while offline

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Per-probe connect timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_SERVICE_ADDR: &str = "api.pushover.net:443";

/// Well-known anycast resolvers; any one answering means we are online
const INTERNET_PROBES: &[&str] = &["1.1.1.1:443", "8.8.8.8:443", "9.9.9.9:443"];

#[async_trait]
pub trait Reachability: Send + Sync {
    async fn internet_reachable(&self) -> bool;
    async fn service_reachable(&self) -> bool;
}

/// TCP connect probes
#[derive(Debug, Clone)]
pub struct NetworkReachability {
    internet: Vec<String>,
    service: String,
    timeout: Duration,
}

impl Default for NetworkReachability {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_ADDR)
    }
}

impl NetworkReachability {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            internet: INTERNET_PROBES.iter().map(|addr| addr.to_string()).collect(),
            service: service.into(),
            timeout: PROBE_TIMEOUT,
        }
    }

    /// Probe the host and port of an API base URL, e.g. `https://api.pushover.net/`
    pub fn for_base_url(base_url: &str) -> Self {
        let service = reqwest::Url::parse(base_url)
            .ok()
            .and_then(|url| {
                let host = url.host_str()?.to_string();
                let port = url.port_or_known_default()?;
                Some(format!("{}:{}", host, port))
            })
            .unwrap_or_else(|| DEFAULT_SERVICE_ADDR.to_string());
        Self::new(service)
    }

    pub fn with_internet_probes(mut self, probes: Vec<String>) -> Self {
        self.internet = probes;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    async fn probe(&self, addr: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr, error = %e, "probe failed");
                false
            }
            Err(_) => {
                debug!(addr, "probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl Reachability for NetworkReachability {
    async fn internet_reachable(&self) -> bool {
        for addr in &self.internet {
            if self.probe(addr).await {
                return true;
            }
        }
        false
    }

    async fn service_reachable(&self) -> bool {
        self.probe(&self.service).await
    }
}
