//! Classifying retry loop over the HTTP engine.
//!
//! The predicate runs in a fixed order (network error, empty body,
//! server error, client error, unparseable JSON), each gated by its
//! config flag. Total attempts are bounded at `max_retries + 1`, with
//! the engine's capped exponential backoff between attempts. The final
//! response carries `metadata.retries` iff more than one attempt ran.

use tracing::{debug, warn};

use super::engine::is_network_failure;
use super::{ConnectionDescriptor, FetchResponse, HttpEngine, RetryMetadata};
use crate::config::{RetryConfig, RetryOn};

pub struct RetryEngine {
    engine: HttpEngine,
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(engine: HttpEngine, config: RetryConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn send(&self, connection: &ConnectionDescriptor) -> FetchResponse {
        if !self.config.enabled {
            return self.engine.send(connection).await;
        }

        let max_attempts = self.config.max_retries + 1;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut response = self.engine.send(connection).await;

            if attempts < max_attempts && should_retry(&response, &self.config.retry_on) {
                let delay = self.config.delay_for_attempt(attempts - 1);
                warn!(
                    status = response.status_code,
                    attempt = attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retryable response, will retry after delay"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if attempts > 1 {
                debug!(
                    status = response.status_code,
                    attempts, "request settled after retries"
                );
                response.metadata_mut().retries = Some(RetryMetadata {
                    occurred: true,
                    attempts,
                    final_attempt: attempts,
                });
            }
            return response;
        }
    }
}

fn should_retry(response: &FetchResponse, retry_on: &RetryOn) -> bool {
    if is_network_failure(response) && retry_on.network_error {
        return true;
    }
    if response.body.as_deref().map_or(true, str::is_empty)
        && response.status_code != 304
        && retry_on.empty_response
    {
        return true;
    }
    if (500..600).contains(&response.status_code) && retry_on.server_error {
        return true;
    }
    if (400..500).contains(&response.status_code) && retry_on.client_error {
        return true;
    }
    if retry_on.parse_error {
        if let Some(body) = response.body.as_deref() {
            if !body.is_empty() && serde_json::from_str::<serde_json::Value>(body).is_err() {
                return true;
            }
        }
    }
    false
}
