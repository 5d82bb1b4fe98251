//! Post-activation health probe.

use std::time::Duration;

use async_trait::async_trait;
use generation_store::HostId;

/// Confirms a freshly activated host is serving.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, host: &HostId, url: &str) -> anyhow::Result<()>;
}

/// HTTP GET; any 2xx status is healthy.
pub struct HttpHealthProbe {
    http_client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("fleetgen/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, host: &HostId, url: &str) -> anyhow::Result<()> {
        let response = self.http_client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{host} health check at {url} returned {status}");
        }
        Ok(())
    }
}
