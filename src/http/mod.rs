//! The request runtime: a redirect-safe HTTPS client with per-request
//! timeouts, a classifying retry loop, and transparent offset-based
//! pagination.
//!
//! The layering is fixed: [`HttpEngine`] issues exactly one logical
//! request (following redirects), [`RetryEngine`] wraps it with the
//! retry classification, and [`Paginator`] fans page requests out
//! through the retry layer. [`RequestRuntime`] packages all three behind
//! the coordinator's fetch contract.

mod engine;
mod pagination;
mod retry;

use std::collections::HashMap;

use async_trait::async_trait;
pub use engine::{HttpEngine, MSG_TIMEOUT, MSG_TOO_MANY_REDIRECTS, MSG_TRANSPORT_ERROR};
pub use pagination::Paginator;
pub use retry::RetryEngine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::access::Fetch;
use crate::config::{HttpRequestOptions, PaginationConfig, RetryConfig};

/// Opaque description of an origin request: either a full `uri` or the
/// `protocol`/`host`/`path` pieces, plus parameters, headers and body.
///
/// The `options` field is transport tuning and is excluded from the
/// request fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionDescriptor {
    pub method: Option<String>,
    pub uri: Option<String>,
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    /// Values may be scalars or sequences; sequences serialize per the
    /// duplicate-parameter options.
    pub parameters: Option<serde_json::Map<String, Value>>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<HttpRequestOptions>,
}

impl ConnectionDescriptor {
    /// A GET of the given URI.
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            method: Some("GET".to_string()),
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn effective_options(&self) -> HttpRequestOptions {
        self.options.clone().unwrap_or_default()
    }

    /// Resolve the target URL and serialize parameters into the query.
    pub fn build_url(&self, options: &HttpRequestOptions) -> Result<Url, String> {
        let mut url = match &self.uri {
            Some(uri) => Url::parse(uri).map_err(|e| format!("invalid uri '{uri}': {e}"))?,
            None => {
                let protocol = self.protocol.as_deref().unwrap_or("https");
                let host = self
                    .host
                    .as_deref()
                    .ok_or("connection requires a uri or a host")?;
                let path = self.path.as_deref().unwrap_or("/");
                let assembled = format!("{protocol}://{host}{path}");
                Url::parse(&assembled).map_err(|e| format!("invalid url '{assembled}': {e}"))?
            }
        };

        if let Some(parameters) = &self.parameters {
            append_parameters(&mut url, parameters, options);
        }
        Ok(url)
    }
}

/// Serialize parameters onto the query string.
///
/// Scalars become one URL-encoded pair. Sequences either join into a
/// single delimited value or repeat the key, optionally suffixed with
/// `[]` or an incrementing index.
fn append_parameters(
    url: &mut Url,
    parameters: &serde_json::Map<String, Value>,
    options: &HttpRequestOptions,
) {
    use crate::config::DuplicateKeySuffix;

    let mut pairs = url.query_pairs_mut();
    for (key, value) in parameters {
        match value {
            Value::Array(items) => {
                if options.separate_duplicate_parameters {
                    for (index, item) in items.iter().enumerate() {
                        let written_key = match options.duplicate_parameter_append_to_key {
                            DuplicateKeySuffix::None => key.clone(),
                            DuplicateKeySuffix::Brackets => format!("{key}[]"),
                            DuplicateKeySuffix::IndexFromZero => format!("{key}{index}"),
                            DuplicateKeySuffix::IndexFromOne => format!("{key}{}", index + 1),
                        };
                        pairs.append_pair(&written_key, &scalar_text(item));
                    }
                } else {
                    let joined = items
                        .iter()
                        .map(scalar_text)
                        .collect::<Vec<_>>()
                        .join(&options.combined_duplicate_parameter_delimiter);
                    pairs.append_pair(key, &joined);
                }
            }
            scalar => {
                pairs.append_pair(key, &scalar_text(scalar));
            }
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Retry bookkeeping, attached iff more than one attempt ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMetadata {
    pub occurred: bool,
    pub attempts: u32,
    #[serde(rename = "finalAttempt")]
    pub final_attempt: u32,
}

/// Pagination bookkeeping, attached iff page fan-out ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMetadata {
    pub occurred: bool,
    #[serde(rename = "totalPages")]
    pub total_pages: u64,
    #[serde(rename = "totalItems")]
    pub total_items: u64,
    pub incomplete: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationMetadata>,
}

/// The response-or-error carrier every layer of the runtime speaks.
///
/// Transport failures are flattened into the same shape (`success`,
/// `statusCode`, `message`) instead of an error path, so the coordinator
/// branches on one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub success: bool,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// Lowercase header names; multi-valued headers joined with ", ".
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FetchMetadata>,
}

impl FetchResponse {
    pub fn shaped(status_code: u16, headers: HashMap<String, String>, body: Option<String>) -> Self {
        Self {
            success: status_code < 400,
            status_code,
            headers,
            body,
            message: None,
            metadata: None,
        }
    }

    pub fn failure(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            headers: HashMap::new(),
            body: None,
            message: Some(message.into()),
            metadata: None,
        }
    }

    fn metadata_mut(&mut self) -> &mut FetchMetadata {
        self.metadata.get_or_insert_with(FetchMetadata::default)
    }
}

/// The full request stack behind the coordinator's fetch contract.
pub struct RequestRuntime {
    retry: RetryEngine,
    paginator: Paginator,
}

impl RequestRuntime {
    pub fn new(retry_config: RetryConfig, pagination_config: PaginationConfig) -> Self {
        Self {
            retry: RetryEngine::new(HttpEngine::new(), retry_config),
            paginator: Paginator::new(pagination_config),
        }
    }

    pub fn retry(&self) -> &RetryEngine {
        &self.retry
    }
}

impl Default for RequestRuntime {
    fn default() -> Self {
        Self::new(RetryConfig::default(), PaginationConfig::default())
    }
}

#[async_trait]
impl Fetch for RequestRuntime {
    async fn fetch(&self, connection: &ConnectionDescriptor, data: &Value) -> FetchResponse {
        let mut connection = connection.clone();

        // Request data rides along as query parameters; caller-set
        // parameters win on conflict.
        if let Value::Object(extra) = data {
            let parameters = connection
                .parameters
                .get_or_insert_with(serde_json::Map::new);
            for (key, value) in extra {
                parameters.entry(key.clone()).or_insert(value.clone());
            }
        }

        let first = self.retry.send(&connection).await;
        self.paginator.expand(&self.retry, &connection, first).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn options() -> HttpRequestOptions {
        HttpRequestOptions::default()
    }

    fn query_of(connection: &ConnectionDescriptor, options: &HttpRequestOptions) -> String {
        connection
            .build_url(options)
            .unwrap()
            .query()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn builds_url_from_pieces() {
        let connection = ConnectionDescriptor {
            host: Some("api.example.com".into()),
            path: Some("/v1/games".into()),
            ..Default::default()
        };
        let url = connection.build_url(&options()).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/games");
    }

    #[test]
    fn scalars_are_url_encoded() {
        let connection = ConnectionDescriptor {
            uri: Some("https://api.example.com/v1".into()),
            parameters: Some(
                json!({"q": "two words", "n": 3})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
            ..Default::default()
        };
        let query = query_of(&connection, &options());
        assert!(query.contains("q=two+words") || query.contains("q=two%20words"));
        assert!(query.contains("n=3"));
    }

    #[test]
    fn sequences_join_with_the_delimiter_by_default() {
        let connection = ConnectionDescriptor {
            uri: Some("https://api.example.com/v1".into()),
            parameters: Some(json!({"ids": [1, 2, 3]}).as_object().unwrap().clone()),
            ..Default::default()
        };
        let query = query_of(&connection, &options());
        assert!(query.contains("ids=1%2C2%2C3"), "query was {query}");
    }

    #[test]
    fn sequences_can_repeat_keys() {
        let connection = ConnectionDescriptor {
            uri: Some("https://api.example.com/v1".into()),
            parameters: Some(json!({"id": ["a", "b"]}).as_object().unwrap().clone()),
            ..Default::default()
        };

        let mut separate = options();
        separate.separate_duplicate_parameters = true;
        assert_eq!(query_of(&connection, &separate), "id=a&id=b");

        separate.duplicate_parameter_append_to_key = crate::config::DuplicateKeySuffix::Brackets;
        assert_eq!(query_of(&connection, &separate), "id%5B%5D=a&id%5B%5D=b");

        separate.duplicate_parameter_append_to_key =
            crate::config::DuplicateKeySuffix::IndexFromZero;
        assert_eq!(query_of(&connection, &separate), "id0=a&id1=b");

        separate.duplicate_parameter_append_to_key =
            crate::config::DuplicateKeySuffix::IndexFromOne;
        assert_eq!(query_of(&connection, &separate), "id1=a&id2=b");
    }

    #[test]
    fn missing_host_and_uri_is_an_error() {
        let connection = ConnectionDescriptor::default();
        assert!(connection.build_url(&options()).is_err());
    }

    #[test]
    fn metadata_serializes_with_wire_names() {
        let mut response = FetchResponse::shaped(200, HashMap::new(), Some("{}".into()));
        response.metadata_mut().retries = Some(RetryMetadata {
            occurred: true,
            attempts: 3,
            final_attempt: 3,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["metadata"]["retries"]["finalAttempt"], 3);
    }
}
