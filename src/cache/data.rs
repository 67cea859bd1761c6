//! The cache policy engine.
//!
//! [`CacheData`] owns the validated settings, the storage tiers, the
//! crypto engine and the memory tier, and implements the read/write
//! mechanics: tier-descending reads (KV → blob), decryption of private
//! bodies, header synthesis (etag / last-modified / expires), size-based
//! tier placement, and the concurrent dual write for oversized records.
//!
//! Nothing here raises after a successful [`CacheData::init`]: failed
//! reads become empty views that force a refresh, failed writes are
//! logged and swallowed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use once_cell::sync::OnceCell;
use sha1::{Digest, Sha1};
use tracing::{debug, error, warn};

use super::entry::{Body, CacheInfo, CacheRecord, CacheView, CachedData, Classification};
use super::interval;
use super::keys::KeyHasher;
use super::memory::MemoryCache;
use crate::config::{CacheDataConfig, CacheDataSettings, ConfigError};
use crate::crypto::Crypto;
use crate::storage::{BlobStore, KvStore};

/// Fallback TTL when a write is handed a past or missing expiry.
const MIN_WRITE_TTL_SECS: i64 = 300;

/// Characters of stored body kept in an oversize stub.
const STUB_PREVIEW_CHARS: usize = 64;

static GLOBAL: OnceCell<Arc<CacheData>> = OnceCell::new();

/// Register a process-wide engine. The first call wins; re-init is a
/// logged no-op so accidental double initialization cannot swap tiers
/// mid-flight.
pub fn init_global(data: Arc<CacheData>) -> bool {
    if GLOBAL.set(data).is_err() {
        warn!("cache engine already initialized; ignoring re-init");
        return false;
    }
    true
}

/// The process-wide engine, when one was registered.
pub fn global() -> Option<Arc<CacheData>> {
    GLOBAL.get().cloned()
}

/// Inputs to [`CacheData::write`].
pub struct WriteParams<'a> {
    pub id: &'a str,
    pub now: i64,
    pub body: Option<String>,
    /// Already filtered to the retained set; keys in any case.
    pub headers: HashMap<String, String>,
    pub host: &'a str,
    pub path: &'a str,
    pub expires: i64,
    pub status_code: u16,
    pub encrypt: bool,
}

pub struct CacheData {
    settings: CacheDataSettings,
    kv: Arc<dyn KvStore>,
    blob: Arc<dyn BlobStore>,
    crypto: Crypto,
    mem: Option<MemoryCache>,
    hasher: KeyHasher,
    /// Timezone offset used for interval alignment, refreshed at init.
    interval_offset_minutes: AtomicI32,
}

impl CacheData {
    /// Validate configuration and assemble the engine. This is the only
    /// fatal path: a missing key, bad numeric bound, or unknown timezone
    /// must surface before traffic is served.
    pub fn init(
        config: CacheDataConfig,
        kv: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
    ) -> Result<Self, ConfigError> {
        let settings = config.resolve()?;

        settings
            .key
            .validate_eager()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let crypto = Crypto::new(settings.algorithm, settings.key.clone());
        let hasher = KeyHasher::new(settings.id_hash_algorithm, settings.fingerprint_salt.clone());
        let mem = settings
            .use_in_memory_cache
            .then(|| MemoryCache::new(&settings.in_memory));

        let now = Utc::now().timestamp();
        let offset = interval::utc_offset_minutes(&settings.time_zone, now);
        debug!(
            algorithm = settings.algorithm.as_str(),
            time_zone = %settings.time_zone,
            interval_offset_minutes = offset,
            max_kv_cache_size_kb = settings.max_kv_cache_size_kb,
            "cache engine initialized"
        );

        Ok(Self {
            settings,
            kv,
            blob,
            crypto,
            mem,
            hasher,
            interval_offset_minutes: AtomicI32::new(offset),
        })
    }

    pub fn settings(&self) -> &CacheDataSettings {
        &self.settings
    }

    pub fn mem(&self) -> Option<&MemoryCache> {
        self.mem.as_ref()
    }

    /// Fingerprint of a request descriptor.
    pub fn fingerprint(&self, value: &serde_json::Value) -> String {
        self.hasher.fingerprint(value)
    }

    /// Pre-resolve lazy key material. Never raises: a failed resolution
    /// is logged and retried by the next seal/open.
    pub async fn prime(&self) {
        if let Err(e) = self.crypto.prime().await {
            warn!(error = %e, "key material priming failed");
        }
    }

    /// The next interval boundary strictly after `t`.
    pub fn interval_next(&self, interval_secs: i64, t: i64) -> i64 {
        interval::next_boundary(
            interval_secs,
            t,
            self.interval_offset_minutes.load(Ordering::Relaxed),
        )
    }

    /// Fetch a record, following the blob redirect and decrypting private
    /// bodies. A missing record yields an empty view carrying
    /// `default_expires`; a *failed* read (stub without blob object,
    /// undecryptable body) yields an empty view with status 500 and
    /// `expires = now`, which forces a refresh upstream.
    pub async fn read(&self, id: &str, default_expires: i64) -> CacheView {
        let Some(record) = self.kv.read(id).await else {
            return CacheView::empty(default_expires, 0);
        };

        let record = if record.data.info.obj_in_s3 {
            match self.blob.read(id).await {
                Some(full) => full,
                None => {
                    error!(id, "stub points at blob store but the object is unreadable");
                    return Self::failed_view();
                }
            }
        } else {
            record
        };

        let classification = record.data.info.classification;
        let body = match record.data.body {
            Body::Sealed(envelope) => match self.crypto.open(&envelope).await {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    error!(id, error = %e, "cached body failed to decrypt; treating as miss");
                    return Self::failed_view();
                }
            },
            Body::Plain(text) => Some(text),
            Body::Null => None,
        };

        CacheView {
            body,
            headers: record.data.headers,
            status_code: record.data.status_code,
            expires: record.expires,
            classification,
        }
    }

    /// Persist a payload, synthesizing validators and placing the record
    /// by size. Both writes of an oversized record run concurrently and
    /// the call returns only when both have settled.
    pub async fn write(&self, params: WriteParams<'_>) -> CacheView {
        let WriteParams {
            id,
            now,
            body,
            headers,
            host,
            path,
            expires,
            status_code,
            encrypt,
        } = params;

        let expires = if expires <= now {
            now + MIN_WRITE_TTL_SECS
        } else {
            expires
        };

        let mut headers = lowercase_headers(headers);
        headers
            .entry("etag".to_string())
            .or_insert_with(|| synthesize_etag(id, body.as_deref()));
        headers
            .entry("last-modified".to_string())
            .or_insert_with(|| http_date(now));
        headers
            .entry("expires".to_string())
            .or_insert_with(|| http_date(expires));

        let classification = Classification::from_encrypt_flag(encrypt);
        let stored_body = if encrypt {
            match self.crypto.seal(body.as_deref()).await {
                Ok(envelope) => Body::Sealed(envelope),
                Err(e) => {
                    // Private data never goes to storage in the clear.
                    error!(id, error = %e, "body failed to encrypt; entry not cached");
                    return CacheView {
                        body,
                        headers,
                        status_code,
                        expires,
                        classification,
                    };
                }
            }
        } else {
            Body::from_plain(body.clone())
        };

        let size_kb = stored_size_kb(&stored_body, &headers);
        let purge_ts = expires + i64::from(self.settings.purge_expired_after_hours) * 3600;

        let record = CacheRecord {
            id_hash: id.to_string(),
            expires,
            purge_ts,
            data: CachedData {
                body: stored_body,
                headers: headers.clone(),
                status_code,
                info: CacheInfo {
                    classification,
                    size_kb,
                    obj_in_s3: false,
                    host: host.to_string(),
                    path: path.to_string(),
                },
            },
        };

        if size_kb > f64::from(self.settings.max_kv_cache_size_kb) {
            let stub = stub_record(&record);
            let (blob_ok, kv_ok) =
                tokio::join!(self.blob.write(id, &record), self.kv.write(&stub));
            if !blob_ok || !kv_ok {
                warn!(id, blob_ok, kv_ok, size_kb, "oversize cache write incomplete");
            } else {
                debug!(id, size_kb, "record written to blob store with KV stub");
            }
        } else if !self.kv.write(&record).await {
            warn!(id, size_kb, "cache write failed");
        }

        CacheView {
            body,
            headers,
            status_code,
            expires,
            classification,
        }
    }

    /// View over payload the caller already holds; used when nothing is
    /// cached yet.
    pub fn format(
        expires: i64,
        body: Option<String>,
        headers: HashMap<String, String>,
        status_code: u16,
    ) -> CacheView {
        CacheView::format(expires, body, lowercase_headers(headers), status_code)
    }

    /// Reachability of the storage tiers plus memory-tier stats, for
    /// health endpoints. The access path never blocks on this.
    pub async fn health(&self) -> CacheHealth {
        let (kv_ok, blob_ok) = tokio::join!(self.kv.health_check(), self.blob.health_check());
        CacheHealth {
            kv_backend: self.kv.backend_name(),
            blob_backend: self.blob.backend_name(),
            kv_ok,
            blob_ok,
            memory: self.mem.as_ref().map(MemoryCache::info),
        }
    }

    fn failed_view() -> CacheView {
        CacheView::empty(Utc::now().timestamp(), 500)
    }
}

/// Snapshot returned by [`CacheData::health`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheHealth {
    pub kv_backend: &'static str,
    pub blob_backend: &'static str,
    pub kv_ok: bool,
    pub blob_ok: bool,
    pub memory: Option<super::memory::MemCacheInfo>,
}

/// Replace body and headers with a redacted stub pointing at the blob
/// store. The preview keeps enough of the stored body to be recognizable
/// in the console without duplicating the payload.
fn stub_record(record: &CacheRecord) -> CacheRecord {
    let preview_source = match &record.data.body {
        Body::Plain(text) => text.as_str(),
        Body::Sealed(envelope) => envelope.encrypted_data.as_str(),
        Body::Null => "",
    };
    let preview: String = preview_source.chars().take(STUB_PREVIEW_CHARS).collect();

    let mut stub = record.clone();
    stub.data.body = Body::Plain(format!("ID: {} PREVIEW: {}", record.id_hash, preview));
    stub.data.info.obj_in_s3 = true;
    stub
}

fn lowercase_headers(headers: HashMap<String, String>) -> HashMap<String, String> {
    headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect()
}

/// First 10 hex chars of SHA-1 over `id || body`.
fn synthesize_etag(id: &str, body: Option<&str>) -> String {
    let mut hasher = Sha1::new();
    hasher.update(id.as_bytes());
    hasher.update(body.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())[..10].to_string()
}

/// Stored size in KB at 3-decimal precision, measured over the
/// serialized payload the KV item would carry.
fn stored_size_kb(body: &Body, headers: &HashMap<String, String>) -> f64 {
    let body_len = serde_json::to_string(body).map(|s| s.len()).unwrap_or(0);
    let header_len: usize = headers.iter().map(|(k, v)| k.len() + v.len() + 6).sum();
    let kb = (body_len + header_len) as f64 / 1024.0;
    (kb * 1000.0).round() / 1000.0
}

/// RFC 1123 HTTP-date for an epoch second.
pub fn http_date(epoch_secs: i64) -> String {
    match Utc.timestamp_opt(epoch_secs, 0).single() {
        Some(datetime) => datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        None => String::new(),
    }
}

/// Parse an HTTP-date (RFC 1123 / 2822 family) to an epoch second.
pub fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyMaterial;
    use crate::storage::{MemoryBlobStore, MemoryKvStore};

    fn engine() -> (Arc<CacheData>, Arc<MemoryKvStore>, Arc<MemoryBlobStore>) {
        let kv = Arc::new(MemoryKvStore::new());
        let blob = Arc::new(MemoryBlobStore::new());
        let config = CacheDataConfig {
            secure_data_key: Some(KeyMaterial::Bytes(vec![9u8; 32])),
            use_in_memory_cache: Some(true),
            ..Default::default()
        };
        let data = CacheData::init(config, kv.clone(), blob.clone()).unwrap();
        (Arc::new(data), kv, blob)
    }

    fn write_params<'a>(id: &'a str, now: i64, body: &str, encrypt: bool) -> WriteParams<'a> {
        WriteParams {
            id,
            now,
            body: Some(body.to_string()),
            headers: HashMap::new(),
            host: "example.com",
            path: "/v1",
            expires: now + 60,
            status_code: 200,
            encrypt,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips_plaintext() {
        let (data, _, _) = engine();
        let now = 1_700_000_000;
        let written = data.write(write_params("id1", now, "{\"v\":1}", false)).await;
        assert_eq!(written.body.as_deref(), Some("{\"v\":1}"));
        assert!(written.headers.contains_key("etag"));
        assert!(written.headers.contains_key("last-modified"));
        assert!(written.headers.contains_key("expires"));

        let read = data.read("id1", now + 30).await;
        assert_eq!(read.body.as_deref(), Some("{\"v\":1}"));
        assert_eq!(read.status_code, 200);
        assert_eq!(read.expires, now + 60);
    }

    #[tokio::test]
    async fn private_bodies_are_sealed_at_rest() {
        let (data, kv, _) = engine();
        let now = 1_700_000_000;
        data.write(write_params("id1", now, "{\"token\":\"abc\"}", true))
            .await;

        let raw = kv.get_raw("id1").unwrap();
        assert!(matches!(raw.data.body, Body::Sealed(_)));
        assert_eq!(raw.data.info.classification, Classification::Private);

        let read = data.read("id1", now + 30).await;
        assert_eq!(read.body.as_deref(), Some("{\"token\":\"abc\"}"));
    }

    #[tokio::test]
    async fn corrupted_ciphertext_forces_refresh() {
        let (data, kv, _) = engine();
        let now = 1_700_000_000;
        data.write(write_params("id1", now, "secret", true)).await;

        let mut raw = kv.get_raw("id1").unwrap();
        if let Body::Sealed(envelope) = &mut raw.data.body {
            envelope.encrypted_data = "00".repeat(envelope.encrypted_data.len() / 2);
        }
        kv.put_raw(raw);

        let read = data.read("id1", now + 30).await;
        assert!(read.is_empty());
        assert_eq!(read.status_code, 500);
        assert!(read.expires <= Utc::now().timestamp());
    }

    #[tokio::test]
    async fn oversize_records_move_to_the_blob_store() {
        let (data, kv, blob) = engine();
        let now = 1_700_000_000;
        let big_body = "x".repeat(50 * 1024);
        data.write(write_params("big", now, &big_body, false)).await;

        let stub = kv.get_raw("big").unwrap();
        assert!(stub.data.info.obj_in_s3);
        match &stub.data.body {
            Body::Plain(text) => assert!(text.starts_with("ID: big PREVIEW: ")),
            other => panic!("expected stub preview, got {other:?}"),
        }
        assert_eq!(blob.len(), 1);

        // The read follows the redirect transparently.
        let read = data.read("big", now + 30).await;
        assert_eq!(read.body.as_deref(), Some(big_body.as_str()));
    }

    #[tokio::test]
    async fn small_records_skip_the_blob_store() {
        let (data, _, blob) = engine();
        data.write(write_params("small", 1_700_000_000, "tiny", false))
            .await;
        assert!(blob.is_empty());
    }

    #[tokio::test]
    async fn stub_with_missing_blob_is_a_failed_read() {
        let (data, kv, blob) = engine();
        let now = 1_700_000_000;
        let big_body = "x".repeat(50 * 1024);
        data.write(write_params("big", now, &big_body, false)).await;

        blob.set_fail_reads(true);
        let read = data.read("big", now + 30).await;
        assert!(read.is_empty());
        assert_eq!(read.status_code, 500);
        let _ = kv;
    }

    #[tokio::test]
    async fn missing_record_is_an_empty_view_with_default_expiry() {
        let (data, _, _) = engine();
        let read = data.read("nope", 12345).await;
        assert!(read.is_empty());
        assert_eq!(read.status_code, 0);
        assert_eq!(read.expires, 12345);
    }

    #[tokio::test]
    async fn past_expiry_is_bumped_on_write() {
        let (data, _, _) = engine();
        let now = 1_700_000_000;
        let mut params = write_params("id1", now, "body", false);
        params.expires = now - 10;
        let view = data.write(params).await;
        assert_eq!(view.expires, now + MIN_WRITE_TTL_SECS);
    }

    #[tokio::test]
    async fn caller_headers_are_lowercased_and_kept() {
        let (data, _, _) = engine();
        let now = 1_700_000_000;
        let mut params = write_params("id1", now, "body", false);
        params.headers = HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            ("ETag".to_string(), "\"origin\"".to_string()),
        ]);
        let view = data.write(params).await;
        assert_eq!(
            view.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        // Origin etag wins over synthesis.
        assert_eq!(view.headers.get("etag").map(String::as_str), Some("\"origin\""));
    }

    #[tokio::test]
    async fn null_body_round_trips() {
        let (data, _, _) = engine();
        let now = 1_700_000_000;
        let mut params = write_params("id1", now, "", true);
        params.body = None;
        data.write(params).await;
        let read = data.read("id1", now + 30).await;
        assert_eq!(read.body, None);
        assert!(!read.is_empty()); // headers were synthesized
    }

    #[test]
    fn etag_is_deterministic_and_short() {
        let a = synthesize_etag("id", Some("body"));
        let b = synthesize_etag("id", Some("body"));
        let c = synthesize_etag("id", Some("other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn http_date_round_trips() {
        let date = http_date(1_700_000_000);
        assert!(date.ends_with("GMT"));
        assert_eq!(parse_http_date(&date), Some(1_700_000_000));
    }

    #[tokio::test]
    async fn interval_next_aligns_to_the_configured_timezone() {
        let (data, _, _) = engine(); // Etc/UTC
        let t = 1_700_000_123;
        let next = data.interval_next(3600, t);
        assert!(next > t);
        assert!(next - t <= 3600);
        assert_eq!(next % 3600, 0);
    }

    #[test]
    fn format_lowercases_headers() {
        let headers = HashMap::from([("ETag".to_string(), "abc".to_string())]);
        let view = CacheData::format(100, Some("body".into()), headers, 200);
        assert_eq!(view.etag(), Some("abc"));
        assert_eq!(view.expires, 100);
    }

    #[tokio::test]
    async fn health_reports_backends_and_memory_stats() {
        let (data, _, _) = engine();
        let health = data.health().await;
        assert_eq!(health.kv_backend, "memory");
        assert_eq!(health.blob_backend, "memory");
        assert!(health.kv_ok);
        assert!(health.blob_ok);
        assert!(health.memory.is_some());
    }

    #[test]
    fn global_registration_is_single_shot() {
        let (data, _, _) = engine();
        let first = init_global(data.clone());
        let second = init_global(data);
        // Another test may have registered first; re-init is always a no-op.
        assert!(!second || first);
        assert!(global().is_some());
    }
}
