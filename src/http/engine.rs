//! Single-request HTTPS engine.
//!
//! Redirect handling is done here rather than in the client so the
//! protocol-upgrade rule can be enforced: an HTTPS request that is
//! redirected to a plain HTTP target is rewritten back to HTTPS before
//! the hop is followed. At most five redirects are followed; 303
//! switches the method to GET and drops the body.
//!
//! Failures never escape as errors. A timeout becomes a 504, transport
//! errors become a 500, and an exhausted redirect budget becomes a 500,
//! all carried in the [`FetchResponse`] shape.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::Method;
use tracing::{debug, error, warn};

use super::{ConnectionDescriptor, FetchResponse};

pub const MSG_TIMEOUT: &str = "https.request resulted in timeout";
pub const MSG_TRANSPORT_ERROR: &str = "https.get resulted in error";
pub const MSG_TOO_MANY_REDIRECTS: &str = "Too many redirects";

const MAX_REDIRECTS: usize = 5;

pub struct HttpEngine {
    client: reqwest::Client,
}

impl HttpEngine {
    pub fn new() -> Self {
        // Redirects are re-implemented in `send`; the client must not
        // follow them on its own.
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .expect("HTTP client construction failed");
        Self { client }
    }

    /// Issue one logical request, following up to five redirects.
    pub async fn send(&self, connection: &ConnectionDescriptor) -> FetchResponse {
        let options = connection.effective_options();
        let timeout = Duration::from_millis(options.effective_timeout_ms());

        let mut url = match connection.build_url(&options) {
            Ok(url) => url,
            Err(message) => return FetchResponse::failure(500, message),
        };

        let method_name = connection.method.as_deref().unwrap_or("GET");
        let mut method = match Method::from_bytes(method_name.to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => return FetchResponse::failure(500, format!("invalid method '{method_name}'")),
        };
        let mut body = connection.body.clone();

        let mut redirects = 0usize;
        loop {
            let mut request = self.client.request(method.clone(), url.clone()).timeout(timeout);
            if let Some(headers) = &connection.headers {
                for (name, value) in headers {
                    request = request.header(name, value);
                }
            }
            if let Some(payload) = &body {
                request = request.body(payload.clone());
            }

            debug!(%url, %method, redirects, "sending request");
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    warn!(%url, timeout_ms = timeout.as_millis() as u64, "request timed out");
                    return FetchResponse::failure(504, MSG_TIMEOUT);
                }
                Err(e) => {
                    error!(%url, error = %e, "transport error");
                    return FetchResponse::failure(500, MSG_TRANSPORT_ERROR);
                }
            };

            let status = response.status().as_u16();
            if !matches!(status, 301 | 302 | 303 | 307) {
                return shape(status, response).await;
            }

            if redirects >= MAX_REDIRECTS {
                warn!(%url, "redirect budget exhausted");
                return FetchResponse::failure(500, MSG_TOO_MANY_REDIRECTS);
            }

            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                // A redirect without a Location goes nowhere; surface it.
                return shape(status, response).await;
            };

            let target = match resolve_redirect(&url, location) {
                Ok(target) => target,
                Err(e) => {
                    error!(%url, location, error = %e, "redirect target is unparseable");
                    return FetchResponse::failure(500, MSG_TRANSPORT_ERROR);
                }
            };

            if status == 301 {
                warn!(from = %url, to = %target, "following permanent redirect");
            }
            if status == 303 {
                method = Method::GET;
                body = None;
            }

            url = target;
            redirects += 1;
        }
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a Location header against the current URL, refusing protocol
/// downgrades: an https request stays https.
fn resolve_redirect(current: &url::Url, location: &str) -> Result<url::Url, url::ParseError> {
    let mut target = current.join(location)?;
    if current.scheme() == "https" && target.scheme() == "http" {
        warn!(%target, "redirect attempted a protocol downgrade; forcing https");
        let _ = target.set_scheme("https");
    }
    Ok(target)
}

async fn shape(status: u16, response: reqwest::Response) -> FetchResponse {
    let mut headers: HashMap<String, String> = HashMap::new();
    for (name, value) in response.headers() {
        let Ok(text) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(text);
            })
            .or_insert_with(|| text.to_string());
    }

    // 304 carries no representation.
    let body = if status == 304 {
        None
    } else {
        match response.text().await {
            Ok(text) => Some(text),
            Err(e) => {
                error!(error = %e, "response body failed to read");
                return FetchResponse::failure(500, MSG_TRANSPORT_ERROR);
            }
        }
    };

    FetchResponse::shaped(status, headers, body)
}

/// A response synthesized from a transport-level failure (as opposed to
/// an HTTP status the origin actually returned).
pub(super) fn is_network_failure(response: &FetchResponse) -> bool {
    matches!(
        response.message.as_deref(),
        Some(MSG_TIMEOUT) | Some(MSG_TRANSPORT_ERROR)
    )
}
