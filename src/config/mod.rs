//! Configuration for the cache engine and request runtime.
//!
//! Every component is configured with a plain struct that can be built in
//! code or deserialized from the caller's own config format. Fields that
//! have an enumerated environment variable fall back to it when unset;
//! explicit configuration always wins.
//!
//! Validation happens once, inside [`crate::cache::CacheData::init`], and
//! misconfiguration is the only fatal error path in the crate: everything
//! after a successful init degrades instead of raising.

mod cache;
mod http;
mod storage;

pub use cache::*;
pub use http::*;
use serde::{Deserialize, Serialize};
pub use storage::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Validation(String),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

/// Symmetric cipher used for private entries at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecureDataAlgorithm {
    #[default]
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl SecureDataAlgorithm {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "aes-256-cbc" | "aes256cbc" => Ok(Self::Aes256Cbc),
            "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            _ => Err(ConfigError::InvalidValue {
                field: "secure_data_algorithm".into(),
                value: value.into(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256Cbc => "aes-256-cbc",
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }
}

/// Digest used for request fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdHashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl IdHashAlgorithm {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            _ => Err(ConfigError::InvalidValue {
                field: "id_hash_algorithm".into(),
                value: value.into(),
            }),
        }
    }
}

/// Read an environment variable, treating empty values as unset.
pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
