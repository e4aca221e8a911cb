use std::sync::Arc;
use std::time::{Duration, Instant};

use diskqueue::QueueError;
use health::HealthHandle;
use http::StatusCode;
use metrics::{counter, histogram};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use super::envelope::{Envelope, ReplayLabels};
use super::queue::ReplayQueue;
use crate::retry::RetryPolicy;

pub const GLOBAL_TAGS_HEADER: &str = "X-Global-Tags";

/// Headers that describe the first hop only.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("an upload failed but it could be retried later: {error}")]
    RetryableRequestError {
        error: reqwest::Error,
        retry_after: Option<Duration>,
    },
    #[error("an upload failed and it cannot be retried: {0}")]
    NonRetryableRequestError(reqwest::Error),
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),
}

impl UploadError {
    fn status_code(&self) -> String {
        let status = match self {
            UploadError::RetryableRequestError { error, .. } => error.status(),
            UploadError::NonRetryableRequestError(error) => error.status(),
            UploadError::InvalidRequest(_) => None,
        };
        status
            .map(|s| s.as_u16().to_string())
            .unwrap_or_else(|| "none".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub upload_url: Url,
    /// `k=v,k=v`, sent as `X-Global-Tags`
    pub global_tags: String,
    pub attempts: u32,
    pub timeout: Duration,
    pub empty_queue_sleep: Duration,
    pub retry_policy: RetryPolicy,
}

/// Drains the replay queue into the upstream endpoint.
pub struct UploadWorker {
    queue: Arc<dyn ReplayQueue + Send + Sync>,
    client: reqwest::Client,
    config: UploadConfig,
    liveness: HealthHandle,
}

impl UploadWorker {
    pub fn new(
        queue: Arc<dyn ReplayQueue + Send + Sync>,
        config: UploadConfig,
        liveness: HealthHandle,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("rum-capture replay uploader")
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            queue,
            client,
            config,
            liveness,
        })
    }

    /// Polls until `cancel` fires. An upload already taken from the queue
    /// runs through its attempts.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.liveness.report_healthy().await;

            let pause = match self.queue.get().await {
                Ok(record) => {
                    self.process(&record).await;
                    continue;
                }
                Err(QueueError::Eof) => self.config.empty_queue_sleep,
                Err(e) => {
                    error!("failed to read the replay queue: {}", e);
                    self.config.empty_queue_sleep
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        debug!("replay upload worker stopped");
    }

    pub async fn process(&self, record: &[u8]) {
        let envelope = match Envelope::decode_record(record) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("dropping undecodable replay record: {}", e);
                counter!("rum_replay_upload_failed_total", "status_code" => "decode").increment(1);
                return;
            }
        };
        let labels = ReplayLabels::of(&envelope);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = self.send(&envelope).await;
            let status_code = match &result {
                Ok(status) => status.as_u16().to_string(),
                Err(e) => e.status_code(),
            };
            let mut tags = labels.labels().to_vec();
            tags.push(("status_code", status_code));
            histogram!("rum_replay_upload_duration_seconds", &tags)
                .record(start.elapsed().as_secs_f64());

            match result {
                Ok(_) => {
                    counter!("rum_replay_upload_total", &tags).increment(1);
                    return;
                }
                Err(UploadError::RetryableRequestError { error, retry_after })
                    if attempt < self.config.attempts =>
                {
                    counter!("rum_replay_upload_failed_total", &tags).increment(1);
                    let wait = self
                        .config
                        .retry_policy
                        .time_until_next_retry(attempt - 1, retry_after);
                    warn!(
                        "replay upload attempt {} failed, retrying in {:?}: {}",
                        attempt, wait, error
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    counter!("rum_replay_upload_failed_total", &tags).increment(1);
                    error!(
                        "dropping replay upload of app {} after {} attempts: {}",
                        labels.app_id, attempt, e
                    );
                    return;
                }
            }
        }
    }

    fn headers(&self, envelope: &Envelope) -> Result<HeaderMap, UploadError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &envelope.headers {
            if HOP_BY_HOP.contains(&name.as_str()) || name == header::CONTENT_LENGTH.as_str() {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
            headers.insert(name, value);
        }
        let tags = HeaderValue::from_str(&self.config.global_tags)
            .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
        headers.insert(GLOBAL_TAGS_HEADER, tags);
        Ok(headers)
    }

    async fn send(&self, envelope: &Envelope) -> Result<StatusCode, UploadError> {
        let headers = self.headers(envelope)?;
        let response = self
            .client
            .post(self.config.upload_url.clone())
            .headers(headers)
            .body(envelope.body.clone())
            .send()
            .await
            .map_err(|e| UploadError::RetryableRequestError {
                error: e,
                retry_after: None,
            })?;

        let retry_after = parse_retry_after_header(response.headers());

        match response.error_for_status() {
            Ok(response) => Ok(response.status()),
            Err(err) => match err.status() {
                Some(status) if is_retryable_status(status) => {
                    Err(UploadError::RetryableRequestError {
                        error: err,
                        retry_after,
                    })
                }
                _ => Err(UploadError::NonRetryableRequestError(err)),
            },
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Reads a `Retry-After` given either in seconds or as an RFC 2822 date.
fn parse_retry_after_header(header_map: &HeaderMap) -> Option<Duration> {
    let retry_after = header_map.get(header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(u) = retry_after.parse::<u64>() {
        return Some(Duration::from_secs(u));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration =
            chrono::DateTime::<chrono::offset::Utc>::from(dt) - chrono::offset::Utc::now();

        // negative when the date is already past
        return duration.to_std().ok();
    }

    None
}
