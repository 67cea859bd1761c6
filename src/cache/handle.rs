//! Per-access cache handle.
//!
//! A [`Cache`] is created for one access, performs at most one read and
//! one write, and is then discarded. It walks the tiers on `read`,
//! decides between update / extend on refresh, and renders the outbound
//! HTTP response with conditional-request handling.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::data::{http_date, parse_http_date, CacheData, WriteParams};
use super::entry::{CacheView, Classification};
use super::memory::MemLookup;
use crate::config::CachePolicy;

/// Where the served payload came from, surfaced to callers in the
/// `x-cprxy-data-source` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    #[serde(rename = "original")]
    Original,
    #[serde(rename = "original:cache-expired")]
    OriginalCacheExpired,
    #[serde(rename = "cache:original-same-as-cache")]
    CacheOriginalSameAsCache,
    #[serde(rename = "cache:memory")]
    CacheMemory,
    #[serde(rename = "cache")]
    Cache,
    #[serde(rename = "error:cache")]
    ErrorCache,
    #[serde(rename = "cache:original-not-modified")]
    CacheOriginalNotModified,
    #[serde(rename = "error:original")]
    ErrorOriginal,
    #[serde(rename = "original:cache-update-forced")]
    OriginalCacheUpdateForced,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::OriginalCacheExpired => "original:cache-expired",
            Self::CacheOriginalSameAsCache => "cache:original-same-as-cache",
            Self::CacheMemory => "cache:memory",
            Self::Cache => "cache",
            Self::ErrorCache => "error:cache",
            Self::CacheOriginalNotModified => "cache:original-not-modified",
            Self::ErrorOriginal => "error:original",
            Self::OriginalCacheUpdateForced => "original:cache-update-forced",
        }
    }
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound HTTP response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

pub struct Cache {
    data: Arc<CacheData>,
    policy: CachePolicy,
    id_hash: String,
    /// Timestamp captured at construction; every decision in this access
    /// uses the same clock reading.
    synced_now: i64,
    /// `synced_now + default_expiration`.
    synced_later: i64,
    store: CacheView,
    status: DataSource,
    error_code: Option<u16>,
}

impl Cache {
    pub fn new(data: Arc<CacheData>, policy: CachePolicy, id_hash: String) -> Self {
        let synced_now = Utc::now().timestamp();
        let synced_later = synced_now + policy.default_expiration_secs;
        Self {
            data,
            policy,
            id_hash,
            synced_now,
            synced_later,
            store: CacheView::empty(synced_now, 0),
            status: DataSource::Cache,
            error_code: None,
        }
    }

    pub fn id_hash(&self) -> &str {
        &self.id_hash
    }

    pub fn status(&self) -> DataSource {
        self.status
    }

    pub fn error_code(&self) -> Option<u16> {
        self.error_code
    }

    pub fn get_response(&self) -> &CacheView {
        &self.store
    }

    pub fn etag(&self) -> Option<&str> {
        self.store.etag()
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.store.last_modified()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.store.is_expired(self.synced_now)
    }

    pub fn needs_refresh(&self) -> bool {
        self.is_expired() || self.is_empty()
    }

    /// Tier-descending lookup: memory first, then the storage engine.
    ///
    /// When the storage read *fails* (as opposed to missing) and the
    /// memory tier still holds an expired copy, that stale copy is served
    /// with a fresh error-extension expiry. This is the only circumstance
    /// under which stale data is served.
    pub async fn read(&mut self) {
        let mut stale_candidate = None;

        if let Some(mem) = self.data.mem() {
            match mem.get(&self.id_hash, self.synced_now) {
                MemLookup::Hit(view) => {
                    debug!(id = %self.id_hash, "memory cache hit");
                    self.store = view;
                    self.status = DataSource::CacheMemory;
                    return;
                }
                MemLookup::Expired(view) => stale_candidate = Some(view),
                MemLookup::Miss => {}
            }
        }

        let view = self.data.read(&self.id_hash, self.synced_later).await;

        if view.status_code == 500 && view.is_empty() {
            if let Some(mut stale) = stale_candidate {
                let extended =
                    self.synced_now + self.policy.default_expiration_extension_on_error_secs;
                stale.expires = extended;
                if let Some(mem) = self.data.mem() {
                    mem.set(&self.id_hash, stale.clone(), extended);
                }
                debug!(id = %self.id_hash, "storage read failed; serving stale memory entry");
                self.store = stale;
                self.status = DataSource::ErrorCache;
                self.error_code = Some(500);
                return;
            }
            // Failed with nothing to fall back to: empty view whose
            // `expires = now` forces a refresh.
            self.store = view;
            return;
        }

        if !view.is_empty() {
            if let Some(mem) = self.data.mem() {
                mem.set(&self.id_hash, view.clone(), view.expires);
            }
            self.store = view;
            self.status = DataSource::Cache;
        } else {
            self.store = view;
        }
    }

    /// Write a fresh origin payload through the engine.
    ///
    /// `expires = 0` lets the policy decide: origin `Expires` /
    /// `Cache-Control: max-age` headers when honored (taking the later of
    /// the two), otherwise the default expiration, interval-aligned when
    /// the policy says so. `reason = None` infers the resulting status
    /// from what was previously cached.
    pub async fn update(
        &mut self,
        body: Option<String>,
        headers: HashMap<String, String>,
        status_code: u16,
        expires: i64,
        reason: Option<DataSource>,
    ) {
        let previous_etag = self.store.etag().map(str::to_string);
        let previous_modified = self.store.last_modified().map(str::to_string);
        let was_expired = self.is_expired();
        let was_empty = self.is_empty();

        let headers = lowercase(headers);
        let effective_expires = self.resolve_expires(expires, &headers);
        let retained = self.retain_headers(headers);

        let view = self
            .data
            .write(WriteParams {
                id: &self.id_hash,
                now: self.synced_now,
                body,
                headers: retained,
                host: &self.policy.host_id,
                path: &self.policy.path_id,
                expires: effective_expires,
                status_code,
                encrypt: self.policy.encrypt,
            })
            .await;

        if let Some(mem) = self.data.mem() {
            mem.set(&self.id_hash, view.clone(), view.expires);
        }

        let unchanged = matches!((&previous_etag, view.etag()), (Some(prev), Some(new)) if prev == new)
            || matches!(
                (&previous_modified, view.last_modified()),
                (Some(prev), Some(new)) if prev == new
            );

        self.store = view;
        self.status = reason.unwrap_or(if was_empty {
            DataSource::Original
        } else if unchanged {
            DataSource::CacheOriginalSameAsCache
        } else if was_expired {
            DataSource::OriginalCacheExpired
        } else {
            DataSource::OriginalCacheUpdateForced
        });
    }

    /// Keep the cached body but push the expiry forward: the 304 and
    /// origin-error paths. `seconds = 0` selects the policy default (the
    /// error-extension window for the error reason).
    pub async fn extend_expires(
        &mut self,
        reason: DataSource,
        seconds: i64,
        error_code: Option<u16>,
    ) {
        let seconds = if seconds > 0 {
            seconds
        } else if reason == DataSource::ErrorOriginal {
            self.policy.default_expiration_extension_on_error_secs
        } else {
            self.policy.default_expiration_secs
        };

        let new_expires = if self.policy.expiration_is_on_interval {
            self.data.interval_next(seconds, self.synced_now)
        } else {
            self.synced_now + seconds
        };

        // Same body, fresh validators for the new lifetime.
        let mut headers = self.store.headers.clone();
        headers.insert("last-modified".to_string(), http_date(self.synced_now));
        headers.insert("expires".to_string(), http_date(new_expires));

        let status_code = if self.store.status_code == 0 {
            error_code.unwrap_or(500)
        } else {
            self.store.status_code
        };

        let view = self
            .data
            .write(WriteParams {
                id: &self.id_hash,
                now: self.synced_now,
                body: self.store.body.clone(),
                headers,
                host: &self.policy.host_id,
                path: &self.policy.path_id,
                expires: new_expires,
                status_code,
                encrypt: self.policy.encrypt,
            })
            .await;

        if let Some(mem) = self.data.mem() {
            mem.set(&self.id_hash, view.clone(), view.expires);
        }

        self.store = view;
        self.status = reason;
        self.error_code = error_code;
    }

    /// Render the outbound response, honoring the client's conditional
    /// validators: a matching `If-None-Match` or an `If-Modified-Since`
    /// at-or-after the cached `last-modified` yields a bodyless 304.
    pub fn generate_response_for_api_gateway(
        &self,
        if_none_match: Option<&str>,
        if_modified_since: Option<&str>,
    ) -> GatewayResponse {
        let now = Utc::now().timestamp();
        let classification = Classification::from_encrypt_flag(self.policy.encrypt);

        let mut headers = self.store.headers.clone();
        headers.insert(
            "access-control-allow-origin".to_string(),
            "*".to_string(),
        );
        headers.insert(
            "cache-control".to_string(),
            format!(
                "{}, max-age={}",
                classification.as_str(),
                self.store.seconds_left(now)
            ),
        );
        headers.insert(
            "x-cprxy-data-source".to_string(),
            self.status.as_str().to_string(),
        );

        if self.client_copy_is_current(if_none_match, if_modified_since) {
            return GatewayResponse {
                status_code: 304,
                headers,
                body: None,
            };
        }

        let status_code = if self.store.status_code != 0 {
            self.store.status_code
        } else {
            self.error_code.unwrap_or(200)
        };

        GatewayResponse {
            status_code,
            headers,
            body: self.store.body.clone(),
        }
    }

    fn client_copy_is_current(
        &self,
        if_none_match: Option<&str>,
        if_modified_since: Option<&str>,
    ) -> bool {
        if let (Some(candidate), Some(etag)) = (if_none_match, self.store.etag()) {
            if candidate == etag {
                return true;
            }
        }
        if let (Some(since), Some(modified)) = (if_modified_since, self.store.last_modified()) {
            if let (Some(since_ts), Some(modified_ts)) =
                (parse_http_date(since), parse_http_date(modified))
            {
                if since_ts >= modified_ts {
                    return true;
                }
            }
        }
        false
    }

    fn resolve_expires(&self, explicit: i64, headers: &HashMap<String, String>) -> i64 {
        if explicit > self.synced_now {
            return explicit;
        }

        let base = if self.policy.expiration_is_on_interval {
            self.data
                .interval_next(self.policy.default_expiration_secs, self.synced_now)
        } else {
            self.synced_later
        };

        if self.policy.override_origin_header_expiration {
            return base;
        }

        match origin_expiry(headers, self.synced_now) {
            Some(origin) if origin > self.synced_now => origin.max(base),
            _ => base,
        }
    }

    /// Filter origin headers down to the retained set. Validators are
    /// always carried: they drive the conditional refresh.
    fn retain_headers(&self, headers: HashMap<String, String>) -> HashMap<String, String> {
        let retained: Vec<String> = self
            .policy
            .headers_to_retain
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        headers
            .into_iter()
            .filter(|(name, _)| {
                matches!(name.as_str(), "etag" | "last-modified" | "expires")
                    || retained.iter().any(|keep| keep == name)
            })
            .collect()
    }

    /// Shift this access's clock forward, as if it were created later.
    #[cfg(test)]
    pub(crate) fn advance_clock(&mut self, seconds: i64) {
        self.synced_now += seconds;
        self.synced_later += seconds;
    }
}

/// Later of the origin's `Expires` header and `Cache-Control: max-age`.
fn origin_expiry(headers: &HashMap<String, String>, now: i64) -> Option<i64> {
    let from_expires = headers.get("expires").and_then(|v| parse_http_date(v));
    let from_max_age = headers
        .get("cache-control")
        .and_then(|v| parse_max_age(v))
        .map(|age| now + age);
    match (from_expires, from_max_age) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|v| v.parse::<i64>().ok())
    })
}

fn lowercase(headers: HashMap<String, String>) -> HashMap<String, String> {
    headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect()
}
