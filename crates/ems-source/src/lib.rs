//! Paginated fetch against the open-data source.

use std::time::Duration;

use anyhow::Context;
use ems_core::RawRecord;
use thiserror::Error;
use tracing::{debug, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ems-source";

pub const DEFAULT_SOURCE_URL: &str = "https://www.datos.gov.co/resource/w6k7-5tme.json";
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_PAGE_PAUSE: Duration = Duration::from_millis(500);

/// How often a failed page request is retried, and how long to wait between
/// attempts: the delay doubles per retry until it hits the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub attempts: usize,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule {
    /// Delay before the given retry, zero-based.
    pub fn delay(&self, retry: usize) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 0..retry {
            if delay >= self.ceiling {
                break;
            }
            delay = delay.saturating_mul(2);
        }
        delay.min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub page_size: usize,
    pub page_pause: Duration,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetrySchedule,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SOURCE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            page_pause: DEFAULT_PAGE_PAUSE,
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source unreachable after retries: {0}")]
    Unavailable(#[from] reqwest::Error),
    #[error("source returned http status {status} for {url}")]
    Status { status: u16, url: String },
}

impl FetchError {
    /// Whether another attempt at the same request could still succeed:
    /// timeouts and connection failures, server errors, and throttling.
    /// Client errors and undecodable payloads are final.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Unavailable(err) => {
                err.is_timeout() || err.is_connect() || err.is_request()
            }
            FetchError::Status { status, .. } => *status == 429 || (500..600).contains(status),
        }
    }
}

/// HTTP client for the paginated endpoint. One instance per pipeline;
/// `fetch_all` materializes the complete dataset in memory.
#[derive(Debug)]
pub struct SourceClient {
    client: reqwest::Client,
    config: SourceConfig,
}

impl SourceClient {
    pub fn new(config: SourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Fetch every available record, page by page, pausing between requests.
    /// A short or empty page ends the walk.
    pub async fn fetch_all(&self, run_id: Uuid) -> Result<Vec<RawRecord>, FetchError> {
        let span = info_span!("source_fetch", %run_id, url = %self.config.base_url);
        let _guard = span.enter();

        let mut records = Vec::new();
        let mut offset = 0usize;

        loop {
            let page = self.fetch_page(offset).await?;
            let page_len = page.len();
            records.extend(page);
            debug!(offset, page_len, total = records.len(), "fetched page");

            if page_len < self.config.page_size {
                break;
            }
            offset += self.config.page_size;
            tokio::time::sleep(self.config.page_pause).await;
        }

        Ok(records)
    }

    /// One page at the given offset, retried on transient failures per the
    /// configured schedule.
    async fn fetch_page(&self, offset: usize) -> Result<Vec<RawRecord>, FetchError> {
        let mut retry = 0usize;
        loop {
            match self.request_page(offset).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_transient() && retry < self.config.retry.attempts => {
                    let delay = self.config.retry.delay(retry);
                    debug!(offset, retry, ?delay, error = %err, "retrying page request");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn request_page(&self, offset: usize) -> Result<Vec<RawRecord>, FetchError> {
        let resp = self
            .client
            .get(&self.config.base_url)
            .query(&[
                ("$limit", self.config.page_size.to_string()),
                ("$offset", offset.to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        Ok(resp.json::<Vec<RawRecord>>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_until_the_ceiling() {
        let schedule = RetrySchedule {
            attempts: 5,
            initial_delay: Duration::from_millis(200),
            ceiling: Duration::from_millis(700),
        };

        assert_eq!(schedule.delay(0), Duration::from_millis(200));
        assert_eq!(schedule.delay(1), Duration::from_millis(400));
        assert_eq!(schedule.delay(2), Duration::from_millis(700));
        assert_eq!(schedule.delay(4), Duration::from_millis(700));
    }

    #[test]
    fn throttling_and_server_errors_are_transient_but_client_errors_are_final() {
        let throttled = FetchError::Status {
            status: 429,
            url: "https://example.test".to_string(),
        };
        let server_error = FetchError::Status {
            status: 503,
            url: "https://example.test".to_string(),
        };
        let missing = FetchError::Status {
            status: 404,
            url: "https://example.test".to_string(),
        };

        assert!(throttled.is_transient());
        assert!(server_error.is_transient());
        assert!(!missing.is_transient());
    }

    #[test]
    fn default_config_targets_the_open_data_endpoint() {
        let config = SourceConfig::default();
        assert_eq!(config.base_url, DEFAULT_SOURCE_URL);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.page_pause, Duration::from_millis(500));
    }
}
