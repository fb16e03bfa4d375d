//! Pump actuator seam. The real pump is a small HTTP service that runs the
//! relay for the requested number of seconds and only then replies, so the
//! request deadline grows with the run length.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{error, info};

use crate::config::PumpConfig;
use crate::error::PumpError;

#[async_trait]
pub trait Pump: Send + Sync {
    /// Run the pump for `seconds`. Any failure means the pump did not run.
    async fn run(&self, seconds: u32) -> Result<(), PumpError>;
}

pub struct HttpPump {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpPump {
    pub fn new(cfg: &PumpConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_sec);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("failed to build pump http client")?;

        Ok(Self {
            http,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    /// Base timeout plus the time the relay is held on.
    fn deadline(&self, seconds: u32) -> Duration {
        self.timeout + Duration::from_secs(seconds as u64)
    }
}

#[async_trait]
impl Pump for HttpPump {
    async fn run(&self, seconds: u32) -> Result<(), PumpError> {
        let url = format!("{}/water", self.base_url);
        info!(%url, seconds, "calling pump");

        let resp = self
            .http
            .get(&url)
            .query(&[("seconds", seconds)])
            .timeout(self.deadline(seconds))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(PumpError::Rejected { status, body })
        }
    }
}

/// Fire-and-forget pump run. The result is only logged.
pub fn spawn_run(pump: Arc<dyn Pump>, seconds: u32, origin: &'static str) {
    tokio::spawn(async move {
        match pump.run(seconds).await {
            Ok(()) => info!(seconds, origin, "pump run complete"),
            Err(e) => error!(seconds, origin, error = %e, "pump run failed"),
        }
    });
}
