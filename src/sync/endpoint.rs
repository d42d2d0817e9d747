//! Remote collector boundary.
//!
//! One delivery per sync attempt carries every row in the batch. Without the
//! `http-sync` feature or an `endpoint_url`, batches go to a simulated
//! endpoint with configurable latency and failure rate.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use rand::Rng;
use serde::Serialize;

use crate::{db::UnsyncedRecords, settings::SyncSettings};

/// Payload of one sync attempt. Serialized as the HTTP request body.
#[derive(Debug, Clone, Serialize)]
pub struct SyncBatch {
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub records: UnsyncedRecords,
}

impl SyncBatch {
    pub fn new(device_id: impl Into<String>, records: UnsyncedRecords) -> Self {
        Self {
            device_id: device_id.into(),
            created_at: Utc::now(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    /// `Ok(())` only when the collector accepted the whole batch.
    async fn deliver(&self, batch: &SyncBatch) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SimulatedEndpoint {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedEndpoint {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.simulated_latency_ms),
            settings.simulated_failure_rate,
        )
    }
}

#[async_trait]
impl SyncEndpoint for SimulatedEndpoint {
    async fn deliver(&self, batch: &SyncBatch) -> Result<()> {
        tokio::time::sleep(self.latency).await;

        let roll: f64 = rand::thread_rng().gen();
        if roll < self.failure_rate {
            bail!("simulated delivery failure");
        }
        debug!("simulated endpoint accepted {} records", batch.len());
        Ok(())
    }
}

#[cfg(feature = "http-sync")]
pub use http::HttpEndpoint;

#[cfg(feature = "http-sync")]
mod http {
    use std::time::Duration;

    use anyhow::{bail, Context, Result};
    use async_trait::async_trait;

    use super::{SyncBatch, SyncEndpoint};

    /// `POST {base}/v1/telemetry/batch` with the batch as JSON. Any 2xx is
    /// success.
    pub struct HttpEndpoint {
        client: reqwest::Client,
        url: String,
        token: Option<String>,
    }

    impl HttpEndpoint {
        pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("failed to build HTTP client")?;

            Ok(Self {
                client,
                url: format!("{}/v1/telemetry/batch", base_url.trim_end_matches('/')),
                token,
            })
        }

        pub fn url(&self) -> &str {
            &self.url
        }
    }

    #[async_trait]
    impl SyncEndpoint for HttpEndpoint {
        async fn deliver(&self, batch: &SyncBatch) -> Result<()> {
            let mut request = self.client.post(&self.url).json(batch);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("request to {} failed", self.url))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("collector returned {status}: {}", body.trim());
            }
            Ok(())
        }
    }
}

/// Picks the transport configured in `settings`.
pub fn endpoint_from_settings(settings: &SyncSettings) -> Result<Arc<dyn SyncEndpoint>> {
    match settings.endpoint_url.as_deref() {
        #[cfg(feature = "http-sync")]
        Some(url) => {
            let endpoint = HttpEndpoint::new(
                url,
                settings.api_token.clone(),
                Duration::from_secs(settings.request_timeout_secs.max(1)),
            )?;
            debug!("sync endpoint: {}", endpoint.url());
            Ok(Arc::new(endpoint))
        }
        #[cfg(not(feature = "http-sync"))]
        Some(url) => {
            log::warn!("endpoint_url {url} ignored: built without the http-sync feature; using simulated endpoint");
            Ok(Arc::new(SimulatedEndpoint::from_settings(settings)))
        }
        None => Ok(Arc::new(SimulatedEndpoint::from_settings(settings))),
    }
}
