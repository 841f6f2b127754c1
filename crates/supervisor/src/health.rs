//! Target health probing

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Checks whether a target answers on its base URL
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the target responded successfully within `timeout`
    async fn probe(&self, base_url: &str, timeout: Duration) -> std::result::Result<(), String>;
}

/// `GET <base_url>/ping`, healthy on any 2xx
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, base_url: &str, timeout: Duration) -> std::result::Result<(), String> {
        let url = format!("{}/ping", base_url.trim_end_matches('/'));
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(format!("{} returned {}", url, resp.status())),
            Err(e) => Err(format!("{} unreachable: {}", url, e)),
        }
    }
}
