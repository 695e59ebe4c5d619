//! Retry logic with exponential backoff for Resource Manager requests.
//!
//! Resource Manager throttles per principal and per subscription (429) and
//! occasionally fails with 5xx under load; both are retried here so a single
//! blip does not fail a whole resource group.

use std::future::Future;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Determines if a reqwest error is retryable.
///
/// Connection errors, timeouts, and other transient issues are retryable.
pub fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect()
        || error.is_timeout()
        || error.is_request()
        // Status errors where we got a response but it was a server error
        || error
            .status()
            .map(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS)
            .unwrap_or(false)
}

/// Execute a request with retry logic.
///
/// `make_request` is called once per attempt. A response whose status is in
/// `retryable_status_codes` is retried until attempts run out, after which it
/// is returned as-is for the caller to map.
pub async fn with_retry<F, Fut>(
    config: &RetryConfig,
    subscription: &str,
    operation: &str,
    make_request: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    if !config.enabled {
        return make_request().await;
    }

    let max_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        let last_attempt = attempt + 1 >= max_attempts;

        match make_request().await {
            Ok(response) => {
                let status = response.status();

                if config.should_retry_status(status.as_u16()) && !last_attempt {
                    let delay = retry_after(&response)
                        .unwrap_or_else(|| config.delay_for_attempt(attempt));
                    warn!(
                        subscription,
                        operation,
                        status = %status,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        "Retryable status code, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                if attempt > 0 {
                    debug!(
                        subscription,
                        operation,
                        status = %status,
                        attempt = attempt + 1,
                        "Request completed after retry"
                    );
                }

                return Ok(response);
            }
            Err(error) => {
                if is_retryable_error(&error) && !last_attempt {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        subscription,
                        operation,
                        error = %error,
                        attempt = attempt + 1,
                        max_attempts,
                        delay_ms = delay.as_millis(),
                        "Retryable error, will retry after delay"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                if attempt > 0 {
                    warn!(
                        subscription,
                        operation,
                        error = %error,
                        attempts = attempt + 1,
                        "Request failed after all retry attempts"
                    );
                }

                return Err(error);
            }
        }
    }
}

/// Honour a `Retry-After` header given in whole seconds, capped at one minute.
fn retry_after(response: &reqwest::Response) -> Option<std::time::Duration> {
    let secs: u64 = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    Some(std::time::Duration::from_secs(secs.min(60)))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_retries_throttled_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/flaky", server.uri());
        let response = with_retry(&fast_retry(3), "sub-a", "test", || client.get(&url).send())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/down", server.uri());
        let response = with_retry(&fast_retry(2), "sub-a", "test", || client.get(&url).send())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/missing", server.uri());
        let response = with_retry(&fast_retry(3), "sub-a", "test", || client.get(&url).send())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disabled_retry_makes_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let config = RetryConfig {
            enabled: false,
            ..fast_retry(5)
        };
        let client = reqwest::Client::new();
        let url = server.uri();
        let response = with_retry(&config, "sub-a", "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            client.get(&url).send()
        })
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
