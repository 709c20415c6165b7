//! Blocking HTTP session shared by the wiki and task API clients: one
//! reqwest client, request spacing, bounded retry with exponential backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct HttpPolicy {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

pub struct HttpSession {
    client: Client,
    policy: HttpPolicy,
    last_request_at: Mutex<Option<Instant>>,
    request_count: AtomicUsize,
}

impl HttpSession {
    pub fn new(policy: HttpPolicy) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_millis(policy.timeout_ms))
            .cookie_store(true)
            .user_agent(policy.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            policy,
            last_request_at: Mutex::new(None),
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Sends the request built by `build`, retrying transient statuses and
    /// connection failures up to `max_retries` times.
    pub fn send_with_retry<F>(&self, endpoint: &str, build: F) -> Result<Response, FetchError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let max_retries = self.policy.max_retries;
        for attempt in 0..=max_retries {
            self.apply_rate_limit();
            match build(&self.client).send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if attempt < max_retries && is_retryable_status(status) {
                        debug!(endpoint, %status, attempt, "retrying after transient status");
                        sleep(retry_delay(self.policy.retry_delay_ms, attempt));
                        continue;
                    }
                    return Err(FetchError::Status {
                        endpoint: endpoint.to_string(),
                        status: status.as_u16(),
                    });
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        debug!(endpoint, %error, attempt, "retrying after transport error");
                        sleep(retry_delay(self.policy.retry_delay_ms, attempt));
                        continue;
                    }
                    return Err(FetchError::Transport {
                        endpoint: endpoint.to_string(),
                        source: error,
                    });
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            endpoint: endpoint.to_string(),
        })
    }

    // The lock is held across the sleep so concurrent workers queue up.
    fn apply_rate_limit(&self) {
        let delay = Duration::from_millis(self.policy.rate_limit_ms);
        let mut last = self
            .last_request_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        *last = Some(Instant::now());
        self.request_count.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn parse_url(raw: &str) -> Result<Url, FetchError> {
    Url::parse(raw).map_err(|error| FetchError::InvalidUrl {
        url: raw.to_string(),
        reason: error.to_string(),
    })
}

fn retry_delay(retry_delay_ms: u64, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt).unwrap_or(16);
    let base = retry_delay_ms.saturating_mul(2u64.saturating_pow(exponent));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_millis() % 100))
        .unwrap_or(0);
    Duration::from_millis(base.saturating_add(jitter))
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
