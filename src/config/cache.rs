use serde::{Deserialize, Serialize};

use super::{env_var, ConfigError, IdHashAlgorithm, SecureDataAlgorithm};
use crate::crypto::KeyMaterial;

/// Environment variables honored when the matching config field is unset.
pub const ENV_SECURE_DATA_ALGORITHM: &str = "CACHE_DATA_SECURE_DATA_ALGORITHM";
pub const ENV_ID_HASH_ALGORITHM: &str = "CACHE_DATA_ID_HASH_ALGORITHM";
pub const ENV_MAX_KV_CACHE_SIZE_KB: &str = "CACHE_DATA_DYNAMO_DB_MAX_CACHE_SIZE_KB";
pub const ENV_PURGE_EXPIRED_AFTER_HOURS: &str = "CACHE_DATA_PURGE_EXPIRED_CACHE_ENTRIES_AFTER_X_HRS";
pub const ENV_TIME_ZONE_FOR_INTERVAL: &str = "CACHE_DATA_TIME_ZONE_FOR_INTERVAL";
pub const ENV_USE_IN_MEMORY_CACHE: &str = "CACHE_USE_IN_MEMORY";
pub const ENV_FINGERPRINT_SALT: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const ENV_FUNCTION_MEMORY_MB: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";

/// Top-level configuration for the cache policy engine.
///
/// `None` fields fall back to the enumerated environment variable and then
/// to the documented default. The encryption key has no environment
/// fallback by policy: key material must be handed over explicitly.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CacheDataConfig {
    /// Cipher for private entries. Default: AES-256-CBC.
    #[serde(default)]
    pub secure_data_algorithm: Option<String>,

    /// Key material for private entries. Required.
    #[serde(skip)]
    pub secure_data_key: Option<KeyMaterial>,

    /// Digest for request fingerprints. Default: sha256.
    #[serde(default)]
    pub id_hash_algorithm: Option<String>,

    /// Records larger than this (KB) move to the blob store. Default: 10.
    #[serde(default)]
    pub max_kv_cache_size_kb: Option<u32>,

    /// Hours an expired record stays readable before its purge timestamp.
    /// Default: 24.
    #[serde(default)]
    pub purge_expired_after_hours: Option<u32>,

    /// TZ database name used for interval-aligned expiration.
    /// Default: Etc/UTC.
    #[serde(default)]
    pub time_zone_for_interval: Option<String>,

    /// Enable the in-process memory tier. Default: true.
    #[serde(default)]
    pub use_in_memory_cache: Option<bool>,

    /// Memory tier sizing.
    #[serde(default)]
    pub in_memory: MemoryCacheConfig,

    /// Salt mixed into every fingerprint, namespacing caches per
    /// deployment. Default: the `AWS_LAMBDA_FUNCTION_NAME` value when
    /// present, empty otherwise.
    #[serde(default)]
    pub fingerprint_salt: Option<String>,
}

impl std::fmt::Debug for CacheDataConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDataConfig")
            .field("secure_data_algorithm", &self.secure_data_algorithm)
            .field("secure_data_key", &self.secure_data_key.as_ref().map(|_| "<set>"))
            .field("id_hash_algorithm", &self.id_hash_algorithm)
            .field("max_kv_cache_size_kb", &self.max_kv_cache_size_kb)
            .field("purge_expired_after_hours", &self.purge_expired_after_hours)
            .field("time_zone_for_interval", &self.time_zone_for_interval)
            .field("use_in_memory_cache", &self.use_in_memory_cache)
            .field("in_memory", &self.in_memory)
            .field("fingerprint_salt", &self.fingerprint_salt)
            .finish()
    }
}

impl CacheDataConfig {
    /// Merge environment fallbacks, apply defaults, and validate.
    ///
    /// This is the single fatal path of the crate: a missing key, a
    /// non-positive size limit or purge window, or an unparseable
    /// timezone must be seen by the caller before serving traffic.
    pub fn resolve(self) -> Result<CacheDataSettings, ConfigError> {
        let algorithm = match self
            .secure_data_algorithm
            .or_else(|| env_var(ENV_SECURE_DATA_ALGORITHM))
        {
            Some(name) => SecureDataAlgorithm::parse(&name)?,
            None => SecureDataAlgorithm::default(),
        };

        let id_hash_algorithm = match self
            .id_hash_algorithm
            .or_else(|| env_var(ENV_ID_HASH_ALGORITHM))
        {
            Some(name) => IdHashAlgorithm::parse(&name)?,
            None => IdHashAlgorithm::default(),
        };

        let key = self
            .secure_data_key
            .ok_or_else(|| ConfigError::Validation("secure_data_key is required".into()))?;

        let max_kv_cache_size_kb = resolve_positive_u32(
            self.max_kv_cache_size_kb,
            ENV_MAX_KV_CACHE_SIZE_KB,
            "max_kv_cache_size_kb",
            DEFAULT_MAX_KV_CACHE_SIZE_KB,
        )?;

        let purge_expired_after_hours = resolve_positive_u32(
            self.purge_expired_after_hours,
            ENV_PURGE_EXPIRED_AFTER_HOURS,
            "purge_expired_after_hours",
            DEFAULT_PURGE_EXPIRED_AFTER_HOURS,
        )?;

        let tz_name = self
            .time_zone_for_interval
            .or_else(|| env_var(ENV_TIME_ZONE_FOR_INTERVAL))
            .unwrap_or_else(|| "Etc/UTC".to_string());
        if tz_name.is_empty() {
            return Err(ConfigError::Validation(
                "time_zone_for_interval cannot be empty".into(),
            ));
        }
        let time_zone: chrono_tz::Tz =
            tz_name
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "time_zone_for_interval".into(),
                    value: tz_name.clone(),
                })?;

        let use_in_memory_cache = self
            .use_in_memory_cache
            .or_else(|| env_var(ENV_USE_IN_MEMORY_CACHE).map(|v| truthy(&v)))
            .unwrap_or(true);

        let fingerprint_salt = self
            .fingerprint_salt
            .or_else(|| env_var(ENV_FINGERPRINT_SALT))
            .unwrap_or_default();

        Ok(CacheDataSettings {
            algorithm,
            key,
            id_hash_algorithm,
            max_kv_cache_size_kb,
            purge_expired_after_hours,
            time_zone,
            use_in_memory_cache,
            in_memory: self.in_memory,
            fingerprint_salt,
        })
    }
}

/// Validated, immutable settings produced by [`CacheDataConfig::resolve`].
#[derive(Debug, Clone)]
pub struct CacheDataSettings {
    pub algorithm: SecureDataAlgorithm,
    pub key: KeyMaterial,
    pub id_hash_algorithm: IdHashAlgorithm,
    pub max_kv_cache_size_kb: u32,
    pub purge_expired_after_hours: u32,
    pub time_zone: chrono_tz::Tz,
    pub use_in_memory_cache: bool,
    pub in_memory: MemoryCacheConfig,
    pub fingerprint_salt: String,
}

const DEFAULT_MAX_KV_CACHE_SIZE_KB: u32 = 10;
const DEFAULT_PURGE_EXPIRED_AFTER_HOURS: u32 = 24;

fn resolve_positive_u32(
    configured: Option<u32>,
    env_name: &str,
    field: &str,
    default: u32,
) -> Result<u32, ConfigError> {
    let value = match configured {
        Some(v) => v,
        None => match env_var(env_name) {
            Some(raw) => raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                field: field.into(),
                value: raw,
            })?,
            None => default,
        },
    };
    if value == 0 {
        return Err(ConfigError::Validation(format!(
            "{field} must be a positive integer"
        )));
    }
    Ok(value)
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// In-process memory tier sizing.
///
/// Capacity is either an absolute entry cap or scaled per GB of function
/// memory (`AWS_LAMBDA_FUNCTION_MEMORY_SIZE`, MB). An absolute cap wins
/// when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    pub max_entries: Option<usize>,
    pub entries_per_gb: Option<usize>,
    /// Entries removed in one eviction sweep once the cache is full.
    pub eviction_batch_size: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            entries_per_gb: None,
            eviction_batch_size: default_eviction_batch_size(),
        }
    }
}

impl MemoryCacheConfig {
    pub fn effective_max_entries(&self) -> usize {
        if let Some(max) = self.max_entries {
            return max.max(1);
        }
        if let Some(per_gb) = self.entries_per_gb {
            if let Some(memory_mb) =
                env_var(ENV_FUNCTION_MEMORY_MB).and_then(|v| v.parse::<f64>().ok())
            {
                let scaled = (per_gb as f64 * memory_mb / 1024.0).round() as usize;
                return scaled.max(1);
            }
        }
        DEFAULT_MEM_CACHE_MAX_ENTRIES
    }
}

const DEFAULT_MEM_CACHE_MAX_ENTRIES: usize = 1000;

fn default_eviction_batch_size() -> usize {
    8
}

/// Per-access caching policy.
///
/// Participates in the request fingerprint: two accesses with different
/// policies are distinct cache entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Ignore origin `Expires` / `Cache-Control: max-age` and always use
    /// the default expiration.
    pub override_origin_header_expiration: bool,

    /// Base TTL in seconds when the origin does not dictate one.
    pub default_expiration_secs: i64,

    /// TTL granted when an origin refresh fails.
    pub default_expiration_extension_on_error_secs: i64,

    /// Snap expiry to the next interval boundary in the configured
    /// timezone instead of `now + default_expiration_secs`.
    pub expiration_is_on_interval: bool,

    /// Header names (case-insensitive) stored alongside the payload.
    pub headers_to_retain: Vec<String>,

    /// Provenance labels for logs; not part of identity.
    pub host_id: String,
    pub path_id: String,

    /// Private (encrypted at rest) vs public (plaintext).
    pub encrypt: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            override_origin_header_expiration: false,
            default_expiration_secs: 60,
            default_expiration_extension_on_error_secs: 3600,
            expiration_is_on_interval: false,
            headers_to_retain: Vec::new(),
            host_id: String::new(),
            path_id: String::new(),
            encrypt: true,
        }
    }
}
