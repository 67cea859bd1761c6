use serde::{Deserialize, Serialize};

use super::{env_var, ConfigError};

pub const ENV_KV_TABLE: &str = "CACHE_DATA_DYNAMO_DB_TABLE";
pub const ENV_BLOB_BUCKET: &str = "CACHE_DATA_S3_BUCKET";

/// Key-value store (DynamoDB) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KvStoreConfig {
    /// Table name. Falls back to `CACHE_DATA_DYNAMO_DB_TABLE`.
    pub table: Option<String>,

    /// AWS region override. Defaults to the SDK credential chain.
    pub region: Option<String>,

    /// Endpoint override, e.g. localstack.
    pub endpoint_url: Option<String>,
}

impl KvStoreConfig {
    pub fn resolve_table(&self) -> Result<String, ConfigError> {
        self.table
            .clone()
            .or_else(|| env_var(ENV_KV_TABLE))
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "KV table name is required (config or {ENV_KV_TABLE})"
                ))
            })
    }
}

/// Blob store (S3) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// Bucket name. Falls back to `CACHE_DATA_S3_BUCKET`.
    pub bucket: Option<String>,

    /// Prefix under which records are written; objects land at
    /// `<prefix><id_hash>.json`.
    pub key_prefix: String,

    pub region: Option<String>,

    pub endpoint_url: Option<String>,

    /// Path-style addressing for S3-compatible services.
    pub force_path_style: bool,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            key_prefix: "cache/".to_string(),
            region: None,
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl BlobStoreConfig {
    pub fn resolve_bucket(&self) -> Result<String, ConfigError> {
        self.bucket
            .clone()
            .or_else(|| env_var(ENV_BLOB_BUCKET))
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "blob bucket name is required (config or {ENV_BLOB_BUCKET})"
                ))
            })
    }

    pub fn object_key(&self, id: &str) -> String {
        format!("{}{}.json", self.key_prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_appends_json_suffix() {
        let config = BlobStoreConfig::default();
        assert_eq!(config.object_key("abc123"), "cache/abc123.json");
    }

    #[test]
    fn explicit_table_wins() {
        temp_env::with_var(ENV_KV_TABLE, Some("env-table"), || {
            let config = KvStoreConfig {
                table: Some("my-cache".into()),
                ..Default::default()
            };
            assert_eq!(config.resolve_table().unwrap(), "my-cache");
        });
    }

    #[test]
    fn table_falls_back_to_env_and_errors_when_absent() {
        temp_env::with_var(ENV_KV_TABLE, Some("env-table"), || {
            assert_eq!(
                KvStoreConfig::default().resolve_table().unwrap(),
                "env-table"
            );
        });
        temp_env::with_var(ENV_KV_TABLE, None::<&str>, || {
            assert!(KvStoreConfig::default().resolve_table().is_err());
        });
    }

    #[test]
    fn bucket_falls_back_to_env() {
        temp_env::with_var(ENV_BLOB_BUCKET, Some("env-bucket"), || {
            assert_eq!(
                BlobStoreConfig::default().resolve_bucket().unwrap(),
                "env-bucket"
            );
        });
    }
}
