//! Full-stack scenarios: coordinator + request runtime against a mock
//! origin, with in-memory storage tiers.

use std::sync::Arc;

use cprxy::access::CacheableAccess;
use cprxy::cache::{CacheData, DataSource};
use cprxy::config::{CacheDataConfig, CachePolicy, PaginationConfig, RetryConfig};
use cprxy::crypto::KeyMaterial;
use cprxy::http::{ConnectionDescriptor, RequestRuntime};
use cprxy::storage::{MemoryBlobStore, MemoryKvStore};
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn access() -> CacheableAccess {
    let config = CacheDataConfig {
        secure_data_key: Some(KeyMaterial::Hex("5c".repeat(32))),
        ..Default::default()
    };
    let data = CacheData::init(
        config,
        Arc::new(MemoryKvStore::new()),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    CacheableAccess::new(Arc::new(data))
}

fn public_policy() -> CachePolicy {
    CachePolicy {
        encrypt: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn cold_fetch_then_memory_hit() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/games"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"v\":1}"))
        .expect(1)
        .mount(&server)
        .await;

    let access = access();
    let runtime = RequestRuntime::default();
    let connection = ConnectionDescriptor::get(format!("{}/games", server.uri()));

    let first = access
        .get_data(
            public_policy(),
            &runtime,
            connection.clone(),
            serde_json::Value::Null,
            None,
        )
        .await;
    assert_eq!(first.status(), DataSource::Original);

    let response = first.generate_response_for_api_gateway(None, None);
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body.as_deref(), Some("{\"v\":1}"));
    assert_eq!(
        response.headers.get("x-cprxy-data-source").map(String::as_str),
        Some("original")
    );

    let second = access
        .get_data(
            public_policy(),
            &runtime,
            connection,
            serde_json::Value::Null,
            None,
        )
        .await;
    assert_eq!(second.status(), DataSource::CacheMemory);
    assert_eq!(second.get_response().body.as_deref(), Some("{\"v\":1}"));
}

#[tokio::test]
async fn expired_entry_revalidates_with_conditional_headers() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{\"feed\":[]}")
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let access = access();
    let runtime = RequestRuntime::default();
    let connection = ConnectionDescriptor::get(format!("{}/feed", server.uri()));

    // One-second TTL: the entry expires before the second access, which
    // must then revalidate.
    let short_lived = CachePolicy {
        encrypt: false,
        default_expiration_secs: 1,
        ..Default::default()
    };

    let first = access
        .get_data(
            short_lived.clone(),
            &runtime,
            connection.clone(),
            serde_json::Value::Null,
            None,
        )
        .await;
    assert_eq!(first.status(), DataSource::Original);

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    // The origin now answers 304 to conditional requests.
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header_exists("if-none-match"))
        .and(header_exists("if-modified-since"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let second = access
        .get_data(
            short_lived,
            &runtime,
            connection,
            serde_json::Value::Null,
            None,
        )
        .await;
    assert_eq!(second.status(), DataSource::CacheOriginalNotModified);
    assert_eq!(second.get_response().body.as_deref(), Some("{\"feed\":[]}"));
}

#[tokio::test]
async fn origin_outage_serves_the_cached_body_with_error_status() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"p\":10}"))
        .mount(&server)
        .await;

    let access = access();
    let runtime = RequestRuntime::new(
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        },
        PaginationConfig::default(),
    );
    let connection = ConnectionDescriptor::get(format!("{}/prices", server.uri()));
    let short_lived = CachePolicy {
        encrypt: false,
        default_expiration_secs: 1,
        ..Default::default()
    };

    let first = access
        .get_data(
            short_lived.clone(),
            &runtime,
            connection.clone(),
            serde_json::Value::Null,
            None,
        )
        .await;
    assert_eq!(first.status(), DataSource::Original);

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/prices"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let second = access
        .get_data(
            short_lived,
            &runtime,
            connection,
            serde_json::Value::Null,
            None,
        )
        .await;
    assert_eq!(second.status(), DataSource::ErrorOriginal);
    assert_eq!(second.error_code(), Some(500));
    assert_eq!(second.get_response().body.as_deref(), Some("{\"p\":10}"));
}

#[tokio::test]
async fn paginated_origin_is_merged_before_caching() {
    init_tracing();
    let server = MockServer::start().await;

    let page = |offset: u64| {
        let items: Vec<u64> = (offset..(offset + 10).min(23)).collect();
        serde_json::json!({"total": 23, "items": items}).to_string()
    };

    Mock::given(method("GET"))
        .and(path("/catalog"))
        .and(query_param("offset", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page(10)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .and(query_param("offset", "20"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page(20)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/catalog"))
        .respond_with(ResponseTemplate::new(200).set_body_string(page(0)))
        .mount(&server)
        .await;

    let access = access();
    let runtime = RequestRuntime::new(
        RetryConfig::default(),
        PaginationConfig {
            enabled: true,
            ..Default::default()
        },
    );
    let mut connection = ConnectionDescriptor::get(format!("{}/catalog", server.uri()));
    connection.parameters = Some(
        serde_json::json!({"limit": 10})
            .as_object()
            .unwrap()
            .clone(),
    );

    let cache = access
        .get_data(
            public_policy(),
            &runtime,
            connection,
            serde_json::Value::Null,
            None,
        )
        .await;
    assert_eq!(cache.status(), DataSource::Original);

    let body: serde_json::Value =
        serde_json::from_str(cache.get_response().body.as_deref().unwrap()).unwrap();
    let items: Vec<u64> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_u64().unwrap())
        .collect();
    assert_eq!(items, (0..23).collect::<Vec<u64>>());
    assert_eq!(body["returned"], 23);
}

#[tokio::test]
async fn client_conditional_request_gets_304_from_cache() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/doc"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"d\":1}"))
        .mount(&server)
        .await;

    let access = access();
    let runtime = RequestRuntime::default();
    let connection = ConnectionDescriptor::get(format!("{}/doc", server.uri()));

    let cache = access
        .get_data(
            public_policy(),
            &runtime,
            connection,
            serde_json::Value::Null,
            None,
        )
        .await;

    let etag = cache.etag().unwrap().to_string();
    let not_modified = cache.generate_response_for_api_gateway(Some(&etag), None);
    assert_eq!(not_modified.status_code, 304);
    assert_eq!(not_modified.body, None);

    let full = cache.generate_response_for_api_gateway(Some("stale-etag"), None);
    assert_eq!(full.status_code, 200);
    assert_eq!(full.body.as_deref(), Some("{\"d\":1}"));
}
