//! AWS Secrets Manager key resolution.
//!
//! Resolves hex-encoded key material from a named secret using the
//! standard credential chain (environment, instance profile, etc.).

use async_trait::async_trait;
use aws_sdk_secretsmanager::Client;
use tracing::info;

use super::{CryptoError, CryptoResult, KeyResolver};

/// Configuration for [`SecretsManagerKeyResolver`].
#[derive(Debug, Clone)]
pub struct SecretsManagerKeyResolverConfig {
    /// Secret name or ARN holding the key.
    pub secret_id: String,

    /// When the secret is a JSON document, the field holding the hex key.
    /// `None` treats the whole secret string as the hex key.
    pub json_field: Option<String>,

    /// AWS region override.
    pub region: Option<String>,

    /// Endpoint override for localstack testing.
    pub endpoint_url: Option<String>,
}

impl SecretsManagerKeyResolverConfig {
    pub fn new(secret_id: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            json_field: None,
            region: None,
            endpoint_url: None,
        }
    }

    pub fn with_json_field(mut self, field: impl Into<String>) -> Self {
        self.json_field = Some(field.into());
        self
    }
}

/// Lazily resolves AES key bytes from AWS Secrets Manager.
pub struct SecretsManagerKeyResolver {
    client: Client,
    config: SecretsManagerKeyResolverConfig,
}

impl SecretsManagerKeyResolver {
    pub async fn new(config: SecretsManagerKeyResolverConfig) -> Self {
        let mut aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            aws_config = aws_config.region(aws_config::Region::new(region.clone()));
        }
        let aws_config = aws_config.load().await;

        let mut sm_config = aws_sdk_secretsmanager::config::Builder::from(&aws_config);
        if let Some(endpoint_url) = &config.endpoint_url {
            sm_config = sm_config.endpoint_url(endpoint_url);
        }

        info!(secret_id = %config.secret_id, "Initializing Secrets Manager key resolver");
        Self {
            client: Client::from_conf(sm_config.build()),
            config,
        }
    }
}

#[async_trait]
impl KeyResolver for SecretsManagerKeyResolver {
    async fn resolve(&self) -> CryptoResult<Vec<u8>> {
        let output = self
            .client
            .get_secret_value()
            .secret_id(&self.config.secret_id)
            .send()
            .await
            .map_err(|e| {
                CryptoError::Resolve(format!(
                    "failed to get secret '{}': {}",
                    self.config.secret_id,
                    e.into_service_error()
                ))
            })?;

        let secret_string = output.secret_string().ok_or_else(|| {
            CryptoError::Resolve(format!(
                "secret '{}' has no string value",
                self.config.secret_id
            ))
        })?;

        let hex_key = match &self.config.json_field {
            Some(field) => {
                let json: serde_json::Value =
                    serde_json::from_str(secret_string).map_err(|e| {
                        CryptoError::Resolve(format!(
                            "secret '{}' is not JSON: {e}",
                            self.config.secret_id
                        ))
                    })?;
                json.get(field)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        CryptoError::Resolve(format!(
                            "secret '{}' has no '{field}' field",
                            self.config.secret_id
                        ))
                    })?
            }
            None => secret_string.to_string(),
        };

        hex::decode(hex_key.trim())
            .map_err(|e| CryptoError::Resolve(format!("secret is not valid hex: {e}")))
    }
}
