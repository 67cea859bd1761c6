use serde::{Deserialize, Serialize};

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: i64 = 8_000;

/// How duplicate query parameters (sequence values) are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicateKeySuffix {
    /// `k=v1&k=v2`
    #[default]
    #[serde(rename = "")]
    None,
    /// `k[]=v1&k[]=v2`
    #[serde(rename = "[]")]
    Brackets,
    /// `k0=v1&k1=v2`
    #[serde(rename = "0++")]
    IndexFromZero,
    /// `k1=v1&k2=v2`
    #[serde(rename = "1++")]
    IndexFromOne,
}

/// Transport tuning for a single request.
///
/// Lives on the connection descriptor's `options` field, which the key
/// hasher strips: transport tuning never affects cache identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRequestOptions {
    /// Per-request timeout. Values `<= 0` are normalized to the default.
    pub timeout_ms: i64,

    /// Emit sequence values as repeated keys rather than one joined value.
    pub separate_duplicate_parameters: bool,

    /// Suffix style for repeated keys.
    pub duplicate_parameter_append_to_key: DuplicateKeySuffix,

    /// Join character when sequence values are combined into one pair.
    pub combined_duplicate_parameter_delimiter: String,
}

impl Default for HttpRequestOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            separate_duplicate_parameters: false,
            duplicate_parameter_append_to_key: DuplicateKeySuffix::None,
            combined_duplicate_parameter_delimiter: ",".to_string(),
        }
    }
}

impl HttpRequestOptions {
    pub fn effective_timeout_ms(&self) -> u64 {
        if self.timeout_ms <= 0 {
            DEFAULT_TIMEOUT_MS as u64
        } else {
            self.timeout_ms as u64
        }
    }
}

/// Which failures the retry loop reacts to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOn {
    pub network_error: bool,
    pub empty_response: bool,
    pub parse_error: bool,
    pub server_error: bool,
    pub client_error: bool,
}

impl Default for RetryOn {
    fn default() -> Self {
        Self {
            network_error: true,
            empty_response: false,
            parse_error: false,
            server_error: true,
            client_error: false,
        }
    }
}

/// Retry loop configuration. Total attempts = `max_retries + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,

    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// Initial delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Cap on the backoff delay in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,

    pub retry_on: RetryOn,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            retry_on: RetryOn::default(),
        }
    }
}

impl RetryConfig {
    /// Delay before retrying a given 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base = (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        std::time::Duration::from_millis(capped as u64)
    }
}

/// Offset-based pagination fan-out.
///
/// Field names are configurable because origins disagree on them; the
/// shape (`total` count + `items` page + `limit`/`offset` parameters) is
/// fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub enabled: bool,

    /// Query parameter carrying the page size.
    pub limit_param: String,

    /// Query parameter carrying the page offset.
    pub offset_param: String,

    /// Body field holding the collection's total count.
    pub total_count_key: String,

    /// Body field holding the page's items.
    pub items_key: String,

    /// Body field rewritten with the merged item count.
    pub returned_count_key: String,

    /// Concurrent sub-requests per batch.
    pub batch_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit_param: "limit".to_string(),
            offset_param: "offset".to_string(),
            total_count_key: "total".to_string(),
            items_key: "items".to_string(),
            returned_count_key: "returned".to_string(),
            batch_size: 5,
        }
    }
}
