//! Encryption at rest for private cache entries.
//!
//! Private payloads are sealed into a `{iv, encryptedData}` envelope of
//! hex strings before they reach storage. The cipher defaults to
//! AES-256-CBC with a random 16-byte IV per call; AES-256-GCM is
//! available as an alternative.
//!
//! Key material is a sum type: raw bytes, a hex string, or a capability
//! that lazily resolves a secret (e.g. AWS Secrets Manager). [`prime`]
//! pre-warms lazy material so the first seal/open on the hot path does
//! not pay the resolution round trip.
//!
//! [`prime`]: Crypto::prime

#[cfg(feature = "secrets-aws")]
mod resolver;

use std::sync::Arc;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
#[cfg(feature = "secrets-aws")]
pub use resolver::{SecretsManagerKeyResolver, SecretsManagerKeyResolverConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::SecureDataAlgorithm;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Plaintext stand-in for the value null, so null payloads round-trip.
pub const NULL_SENTINEL: &str = "{{{null}}}";

const CBC_IV_LEN: usize = 16;
const GCM_NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key error: {0}")]
    Key(String),

    #[error("Key resolution error: {0}")]
    Resolve(String),

    #[error("Cipher error: {0}")]
    Cipher(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Resolves key bytes from an external source (secret store, KMS, ...).
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self) -> CryptoResult<Vec<u8>>;
}

/// Encryption key material.
///
/// `Lazy` variants resolve once and cache the result; concurrent callers
/// share the single resolution.
#[derive(Clone)]
pub enum KeyMaterial {
    Bytes(Vec<u8>),
    Hex(String),
    Lazy(Arc<LazyKey>),
}

pub struct LazyKey {
    resolver: Arc<dyn KeyResolver>,
    cell: OnceCell<Vec<u8>>,
}

impl KeyMaterial {
    pub fn lazy(resolver: Arc<dyn KeyResolver>) -> Self {
        Self::Lazy(Arc::new(LazyKey {
            resolver,
            cell: OnceCell::new(),
        }))
    }

    /// Key bytes, resolving lazy material on first use.
    pub async fn get_bytes(&self) -> CryptoResult<Vec<u8>> {
        match self {
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Hex(hex_str) => hex::decode(hex_str.trim())
                .map_err(|e| CryptoError::Key(format!("key is not valid hex: {e}"))),
            Self::Lazy(lazy) => {
                let bytes = lazy
                    .cell
                    .get_or_try_init(|| lazy.resolver.resolve())
                    .await?;
                Ok(bytes.clone())
            }
        }
    }

    /// Pre-resolve lazy material. Safe to call concurrently; later calls
    /// return immediately once the key is cached.
    pub async fn prime(&self) -> CryptoResult<()> {
        if let Self::Lazy(lazy) = self {
            lazy.cell
                .get_or_try_init(|| lazy.resolver.resolve())
                .await?;
        }
        Ok(())
    }

    /// Eager length check for non-lazy material, run at init time.
    pub fn validate_eager(&self) -> CryptoResult<()> {
        match self {
            Self::Bytes(bytes) => check_key_len(bytes.len()),
            Self::Hex(hex_str) => {
                let bytes = hex::decode(hex_str.trim())
                    .map_err(|e| CryptoError::Key(format!("key is not valid hex: {e}")))?;
                check_key_len(bytes.len())
            }
            Self::Lazy(_) => Ok(()),
        }
    }
}

fn check_key_len(len: usize) -> CryptoResult<()> {
    if len != KEY_LEN {
        return Err(CryptoError::Key(format!(
            "key must be {KEY_LEN} bytes, got {len}"
        )));
    }
    Ok(())
}

// Key material never appears in logs.
impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(_) => f.write_str("KeyMaterial::Bytes(<redacted>)"),
            Self::Hex(_) => f.write_str("KeyMaterial::Hex(<redacted>)"),
            Self::Lazy(_) => f.write_str("KeyMaterial::Lazy(<resolver>)"),
        }
    }
}

/// Hex envelope stored in place of a private payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub iv: String,
    #[serde(rename = "encryptedData")]
    pub encrypted_data: String,
}

/// Symmetric seal/open engine for private entries.
pub struct Crypto {
    algorithm: SecureDataAlgorithm,
    key: KeyMaterial,
}

impl Crypto {
    pub fn new(algorithm: SecureDataAlgorithm, key: KeyMaterial) -> Self {
        Self { algorithm, key }
    }

    pub fn algorithm(&self) -> SecureDataAlgorithm {
        self.algorithm
    }

    /// Pre-resolve lazy key material.
    pub async fn prime(&self) -> CryptoResult<()> {
        self.key.prime().await
    }

    /// Encrypt a payload. `None` is carried via the null sentinel so it
    /// survives the round trip.
    pub async fn seal(&self, plaintext: Option<&str>) -> CryptoResult<Envelope> {
        let key = self.key_bytes().await?;
        let plaintext = plaintext.unwrap_or(NULL_SENTINEL).as_bytes();

        match self.algorithm {
            SecureDataAlgorithm::Aes256Cbc => {
                let mut iv = [0u8; CBC_IV_LEN];
                rand::thread_rng().fill_bytes(&mut iv);
                let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
                    .map_err(|e| CryptoError::Cipher(e.to_string()))?;
                let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
                Ok(Envelope {
                    iv: hex::encode(iv),
                    encrypted_data: hex::encode(ciphertext),
                })
            }
            SecureDataAlgorithm::Aes256Gcm => {
                let mut nonce = [0u8; GCM_NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let cipher = Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| CryptoError::Cipher(e.to_string()))?;
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), plaintext)
                    .map_err(|e| CryptoError::Cipher(e.to_string()))?;
                Ok(Envelope {
                    iv: hex::encode(nonce),
                    encrypted_data: hex::encode(ciphertext),
                })
            }
        }
    }

    /// Decrypt an envelope. The null sentinel maps back to `None`.
    pub async fn open(&self, envelope: &Envelope) -> CryptoResult<Option<String>> {
        let key = self.key_bytes().await?;
        let iv = hex::decode(&envelope.iv)
            .map_err(|e| CryptoError::Cipher(format!("iv is not valid hex: {e}")))?;
        let ciphertext = hex::decode(&envelope.encrypted_data)
            .map_err(|e| CryptoError::Cipher(format!("ciphertext is not valid hex: {e}")))?;

        let plaintext = match self.algorithm {
            SecureDataAlgorithm::Aes256Cbc => {
                let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
                    .map_err(|e| CryptoError::Cipher(e.to_string()))?;
                cipher
                    .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
                    .map_err(|e| CryptoError::Cipher(format!("decrypt failed: {e}")))?
            }
            SecureDataAlgorithm::Aes256Gcm => {
                if iv.len() != GCM_NONCE_LEN {
                    return Err(CryptoError::Cipher(format!(
                        "nonce must be {GCM_NONCE_LEN} bytes, got {}",
                        iv.len()
                    )));
                }
                let cipher = Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| CryptoError::Cipher(e.to_string()))?;
                cipher
                    .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
                    .map_err(|e| CryptoError::Cipher(format!("decrypt failed: {e}")))?
            }
        };

        let text = String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Cipher(format!("plaintext is not UTF-8: {e}")))?;
        if text == NULL_SENTINEL {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }

    async fn key_bytes(&self) -> CryptoResult<Vec<u8>> {
        let key = self.key.get_bytes().await?;
        check_key_len(key.len())?;
        Ok(key)
    }
}
