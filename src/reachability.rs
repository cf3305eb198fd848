use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReachabilitySettings;
use crate::error::ReachabilityError;
use crate::pacing::{self, Cancelled};

/// Probes an ordered list of "what is my address" endpoints.
#[derive(Clone)]
pub struct Reachability {
    client: reqwest::Client,
    endpoints: Vec<String>,
    retry: Duration,
}

impl Reachability {
    pub fn new(settings: &ReachabilitySettings) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if settings.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(settings.timeout_secs));
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            endpoints: settings.endpoints.clone(),
            retry: Duration::from_secs(settings.retry_secs),
        })
    }

    /// Our public address as reported by the first endpoint that answers.
    pub async fn own_address(&self) -> Result<String, ReachabilityError> {
        for endpoint in &self.endpoints {
            match self.probe(endpoint).await {
                Ok(addr) if !addr.is_empty() => {
                    debug!(endpoint, addr, "address echo");
                    return Ok(addr);
                }
                Ok(_) => debug!(endpoint, "empty address echo"),
                Err(e) => debug!(endpoint, error = %e, "address echo failed"),
            }
        }
        Err(ReachabilityError {
            tried: self.endpoints.len(),
        })
    }

    async fn probe(&self, endpoint: &str) -> Result<String, reqwest::Error> {
        let body = self
            .client
            .get(endpoint)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().to_string())
    }

    pub async fn is_reachable(&self) -> bool {
        self.own_address().await.is_ok()
    }

    /// Block until the network answers. Returns true if an outage was observed,
    /// in which case the caller should reload its page before resuming.
    pub async fn wait_until_reachable(&self, cancel: &CancellationToken) -> Result<bool, Cancelled> {
        let mut outage = false;
        loop {
            pacing::check(cancel)?;
            if self.is_reachable().await {
                if outage {
                    info!("network reachable again");
                }
                return Ok(outage);
            }
            if !outage {
                warn!(retry_secs = self.retry.as_secs(), "network unreachable, suspending");
            }
            outage = true;
            pacing::sleep(self.retry, cancel).await?;
        }
    }
}
