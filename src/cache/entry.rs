//! Stored record shapes.
//!
//! The same record serializes to the KV item's `data` attribute and to
//! the blob-store JSON document; field names are wire-stable
//! (`statusCode`, `objInS3`, `size_kb`, `encryptedData`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::Envelope;

/// Whether the body is encrypted at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    #[default]
    Public,
    Private,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }

    pub fn from_encrypt_flag(encrypt: bool) -> Self {
        if encrypt {
            Self::Private
        } else {
            Self::Public
        }
    }
}

/// Stored body: plaintext, an encryption envelope, or null.
///
/// Untagged so the wire form is the bare string / object / null the
/// stores have always held. Variant order matters: the envelope map is
/// tried before the string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Sealed(Envelope),
    Plain(String),
    Null,
}

impl Body {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn from_plain(body: Option<String>) -> Self {
        match body {
            Some(text) => Self::Plain(text),
            None => Self::Null,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::Null
    }
}

/// Provenance and placement metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheInfo {
    #[serde(default)]
    pub classification: Classification,

    /// Payload size in KB, 3-decimal precision.
    #[serde(default)]
    pub size_kb: f64,

    /// True when the KV record is a stub and the full record lives in the
    /// blob store under the same key.
    #[serde(rename = "objInS3", default)]
    pub obj_in_s3: bool,

    /// Labels for logs; never part of identity.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
}

/// The cached payload with its retained headers and status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachedData {
    #[serde(default)]
    pub body: Body,

    /// Retained headers; keys are always lowercase.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(rename = "statusCode", default)]
    pub status_code: u16,

    #[serde(default)]
    pub info: CacheInfo,
}

/// One cache entry, keyed by fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id_hash: String,

    /// Absolute expiry, seconds since epoch.
    pub expires: i64,

    /// Absolute purge time = expires + purge window. Not part of the KV
    /// read projection, so it defaults on the way back in.
    #[serde(default)]
    pub purge_ts: i64,

    pub data: CachedData,
}

/// Decrypted, in-memory view of a cache entry.
///
/// This is what the per-access handle works with and what the memory
/// tier stores: body already opened, headers lowercase, absolute expiry.
#[derive(Debug, Clone, Default)]
pub struct CacheView {
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    pub status_code: u16,
    pub expires: i64,
    pub classification: Classification,
}

impl CacheView {
    /// The nothing-cached constructor.
    pub fn empty(expires: i64, status_code: u16) -> Self {
        Self {
            body: None,
            headers: HashMap::new(),
            status_code,
            expires,
            classification: Classification::Public,
        }
    }

    /// View over payload the caller already holds.
    pub fn format(
        expires: i64,
        body: Option<String>,
        headers: HashMap<String, String>,
        status_code: u16,
    ) -> Self {
        Self {
            body,
            headers,
            status_code,
            expires,
            classification: Classification::Public,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_none() && self.headers.is_empty()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires <= now
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag").map(String::as_str)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified").map(String::as_str)
    }

    pub fn seconds_left(&self, now: i64) -> i64 {
        (self.expires - now).max(0)
    }
}
