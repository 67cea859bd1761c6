//! Offset-based pagination fan-out.
//!
//! When the first page's body carries both the total-count field and the
//! items field, the remaining offsets are computed up front and fetched
//! in bounded concurrent batches through the retry layer. Sub-requests
//! never paginate: the fan-out is one level deep by construction, not
//! by heuristic.
//!
//! Pagination never raises and never discards data: a failed batch marks
//! the merge `incomplete`, records the error, and returns whatever was
//! collected in offset order.

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ConnectionDescriptor, FetchResponse, PaginationMetadata, RetryEngine};
use crate::config::PaginationConfig;

pub struct Paginator {
    config: PaginationConfig,
}

impl Paginator {
    pub fn new(config: PaginationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    /// Expand the first page into the full collection when the response
    /// is paginated; pass everything else through untouched.
    pub async fn expand(
        &self,
        retry: &RetryEngine,
        connection: &ConnectionDescriptor,
        first: FetchResponse,
    ) -> FetchResponse {
        if !self.config.enabled || !first.success {
            return first;
        }
        let Some(body_text) = first.body.as_deref() else {
            return first;
        };
        let Ok(mut body) = serde_json::from_str::<Value>(body_text) else {
            // Unparseable body: degrade to "no pagination".
            return first;
        };

        let Some(total) = body.get(&self.config.total_count_key).and_then(Value::as_u64) else {
            return first;
        };
        let Some(first_items) = body.get(&self.config.items_key).and_then(Value::as_array) else {
            return first;
        };

        let limit = connection
            .parameters
            .as_ref()
            .and_then(|params| params.get(&self.config.limit_param))
            .and_then(Value::as_u64)
            .unwrap_or(first_items.len() as u64);
        if limit == 0 {
            return first;
        }

        // Remaining offsets: limit, 2*limit, ..., floor(total/limit)*limit.
        let offsets: Vec<u64> = (1..=total / limit)
            .map(|page| page * limit)
            .filter(|offset| *offset < total.max(1))
            .collect();
        if offsets.is_empty() {
            return first;
        }

        let total_pages = total.div_ceil(limit);
        debug!(total, limit, total_pages, "expanding paginated response");

        let mut items: Vec<Value> = first_items.clone();
        let mut incomplete = false;
        let mut error: Option<String> = None;

        'batches: for batch in offsets.chunks(self.config.batch_size.max(1)) {
            let requests = batch.iter().map(|offset| {
                let request = self.page_request(connection, *offset, limit);
                async move { retry.send(&request).await }
            });
            let responses = join_all(requests).await;

            // Merge within the batch in offset order, which join_all
            // preserves regardless of completion order.
            for (offset, response) in batch.iter().zip(responses) {
                match page_items(&response, &self.config.items_key) {
                    Ok(page) => items.extend(page),
                    Err(message) => {
                        warn!(offset, error = %message, "page request failed; merge is incomplete");
                        incomplete = true;
                        error = Some(message);
                        break 'batches;
                    }
                }
            }
        }

        if let Some(map) = body.as_object_mut() {
            map.insert(self.config.items_key.clone(), Value::Array(items.clone()));
            map.insert(
                self.config.returned_count_key.clone(),
                Value::from(items.len() as u64),
            );
            // The merged body is no longer one page of anything.
            map.remove(&self.config.offset_param);
            map.remove(&self.config.limit_param);
        }

        let mut merged = first.clone();
        merged.body = serde_json::to_string(&body).ok().or(first.body);
        merged.metadata_mut().pagination = Some(PaginationMetadata {
            occurred: true,
            total_pages,
            total_items: total,
            incomplete,
            error,
        });
        merged
    }

    /// The sub-request for one page: parent parameters plus the offset,
    /// pagination structurally disabled (sub-requests go straight to the
    /// retry layer).
    fn page_request(
        &self,
        connection: &ConnectionDescriptor,
        offset: u64,
        limit: u64,
    ) -> ConnectionDescriptor {
        let mut request = connection.clone();
        let parameters = request.parameters.get_or_insert_with(serde_json::Map::new);
        parameters.insert(self.config.offset_param.clone(), Value::from(offset));
        parameters
            .entry(self.config.limit_param.clone())
            .or_insert(Value::from(limit));
        request
    }
}

fn page_items(response: &FetchResponse, items_key: &str) -> Result<Vec<Value>, String> {
    if !response.success {
        return Err(response
            .message
            .clone()
            .unwrap_or_else(|| format!("page request returned {}", response.status_code)));
    }
    let body = response
        .body
        .as_deref()
        .ok_or_else(|| "page response had no body".to_string())?;
    let parsed: Value =
        serde_json::from_str(body).map_err(|e| format!("page body failed to parse: {e}"))?;
    match parsed.get(items_key) {
        Some(Value::Array(items)) => Ok(items.clone()),
        _ => Err(format!("page body has no '{items_key}' array")),
    }
}
