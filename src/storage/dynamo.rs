//! DynamoDB-backed [`KvStore`].
//!
//! One item per cache entry: partition key `id_hash` (S), `expires` and
//! `purge_ts` as numbers, and the nested payload under the `data`
//! attribute as a native DynamoDB map. Reads project exactly
//! `{id_hash, data, expires}`.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use tracing::{debug, error, info, instrument};

use super::KvStore;
use crate::cache::{CacheRecord, CachedData};
use crate::config::{ConfigError, KvStoreConfig};

pub struct DynamoKvStore {
    client: Client,
    table: String,
}

impl DynamoKvStore {
    pub async fn new(config: KvStoreConfig) -> Result<Self, ConfigError> {
        let table = config.resolve_table()?;
        info!(table = %table, "Initializing DynamoDB KV store");

        let mut aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            aws_config = aws_config.region(aws_config::Region::new(region.clone()));
        }
        let aws_config = aws_config.load().await;

        let mut db_config = aws_sdk_dynamodb::config::Builder::from(&aws_config);
        if let Some(endpoint_url) = &config.endpoint_url {
            db_config = db_config.endpoint_url(endpoint_url);
        }

        Ok(Self {
            client: Client::from_conf(db_config.build()),
            table,
        })
    }
}

#[async_trait]
impl KvStore for DynamoKvStore {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn read(&self, id: &str) -> Option<CacheRecord> {
        let output = match self
            .client
            .get_item()
            .table_name(&self.table)
            .key("id_hash", AttributeValue::S(id.to_string()))
            .projection_expression("id_hash, #d, expires")
            .expression_attribute_names("#d", "data")
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(id, error = %e.into_service_error(), "KV read failed");
                return None;
            }
        };

        let item = output.item?;
        match item_to_record(id, &item) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(id, error = %e, "KV item failed to decode");
                None
            }
        }
    }

    #[instrument(skip(self, record), fields(table = %self.table, id = %record.id_hash))]
    async fn write(&self, record: &CacheRecord) -> bool {
        let data_attr = match serde_json::to_value(&record.data) {
            Ok(value) => json_to_attr(&value),
            Err(e) => {
                error!(id = %record.id_hash, error = %e, "record failed to serialize");
                return false;
            }
        };

        let result = self
            .client
            .put_item()
            .table_name(&self.table)
            .item("id_hash", AttributeValue::S(record.id_hash.clone()))
            .item("expires", AttributeValue::N(record.expires.to_string()))
            .item("purge_ts", AttributeValue::N(record.purge_ts.to_string()))
            .item("data", data_attr)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(id = %record.id_hash, expires = record.expires, "KV item written");
                true
            }
            Err(e) => {
                error!(id = %record.id_hash, error = %e.into_service_error(), "KV write failed");
                false
            }
        }
    }

    async fn health_check(&self) -> bool {
        match self
            .client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(table = %self.table, error = %e.into_service_error(), "KV health check failed");
                false
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "dynamodb"
    }
}

fn item_to_record(
    id: &str,
    item: &HashMap<String, AttributeValue>,
) -> Result<CacheRecord, String> {
    let expires = item
        .get("expires")
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
        .ok_or("missing or non-numeric 'expires'")?;

    let data_value = item
        .get("data")
        .map(attr_to_json)
        .ok_or("missing 'data' attribute")?;
    let data: CachedData =
        serde_json::from_value(data_value).map_err(|e| format!("bad 'data' shape: {e}"))?;

    Ok(CacheRecord {
        id_hash: id.to_string(),
        expires,
        purge_ts: 0,
        data,
    })
}

fn json_to_attr(value: &serde_json::Value) -> AttributeValue {
    match value {
        serde_json::Value::Null => AttributeValue::Null(true),
        serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
        serde_json::Value::Number(n) => AttributeValue::N(n.to_string()),
        serde_json::Value::String(s) => AttributeValue::S(s.clone()),
        serde_json::Value::Array(items) => {
            AttributeValue::L(items.iter().map(json_to_attr).collect())
        }
        serde_json::Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attr(v)))
                .collect(),
        ),
    }
}

fn attr_to_json(attr: &AttributeValue) -> serde_json::Value {
    match attr {
        AttributeValue::Null(_) => serde_json::Value::Null,
        AttributeValue::Bool(b) => serde_json::Value::Bool(*b),
        AttributeValue::N(n) => n
            .parse::<i64>()
            .map(serde_json::Value::from)
            .or_else(|_| n.parse::<f64>().map(serde_json::Value::from))
            .unwrap_or(serde_json::Value::Null),
        AttributeValue::S(s) => serde_json::Value::String(s.clone()),
        AttributeValue::L(items) => {
            serde_json::Value::Array(items.iter().map(attr_to_json).collect())
        }
        AttributeValue::M(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attr_to_json(v)))
                .collect(),
        ),
        // Binary and set types never appear in cache records.
        _ => serde_json::Value::Null,
    }
}
