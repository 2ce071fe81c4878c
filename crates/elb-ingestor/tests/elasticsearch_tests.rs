//! Elasticsearch bulk client tests
//!
//! Uses wiremock as the cluster to check:
//! - Request shape (NDJSON, ids, index names)
//! - Error classification for HTTP statuses and per-item failures
//! - Host failover

use elb_ingestor::store::{BulkOutcome, DocumentStore, ElasticsearchStore, IndexedDocument, StoreError};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn docs(n: usize) -> Vec<IndexedDocument> {
    (0..n)
        .map(|i| IndexedDocument {
            index: "logs-platform-2024.03.01".to_string(),
            id: format!("{:064x}", i),
            source: json!({ "@timestamp": "2024-03-01T12:00:00.000000Z", "n": i }),
        })
        .collect()
}

fn store_for(hosts: &[&str]) -> ElasticsearchStore {
    ElasticsearchStore::new(
        hosts.iter().map(|h| h.to_string()).collect(),
        Duration::from_secs(5),
    )
    .expect("Store should be created")
}

fn item(status: u16) -> serde_json::Value {
    json!({ "index": { "_index": "logs-platform-2024.03.01", "status": status } })
}

// ============================================================================
// Success Path
// ============================================================================

#[tokio::test]
async fn test_bulk_request_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(header("content-type", "application/x-ndjson"))
        .and(body_string_contains(r#""_id":"0000000000000000000000000000000000000000000000000000000000000001""#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "took": 3,
            "errors": false,
            "items": [item(201), item(201)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = store_for(&[&server.uri()])
        .bulk_upsert(&docs(2))
        .await
        .expect("Bulk request should succeed");

    assert_eq!(outcome, BulkOutcome { written: 2, failed: 0 });
}

#[tokio::test]
async fn test_item_failures_are_counted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [
                item(200),
                { "index": { "status": 400, "error": { "type": "mapper_parsing_exception" } } },
                item(201)
            ]
        })))
        .mount(&server)
        .await;

    let outcome = store_for(&[&server.uri()])
        .bulk_upsert(&docs(3))
        .await
        .expect("Batch should be accepted");

    assert_eq!(outcome, BulkOutcome { written: 2, failed: 1 });
}

#[tokio::test]
async fn test_empty_batch_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let outcome = store_for(&[&server.uri()])
        .bulk_upsert(&[])
        .await
        .expect("Empty batch should succeed");
    assert_eq!(outcome, BulkOutcome::default());
}

// ============================================================================
// Error Classification
// ============================================================================

#[tokio::test]
async fn test_throttled_items_make_batch_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [item(201), item(429)]
        })))
        .mount(&server)
        .await;

    let err = store_for(&[&server.uri()])
        .bulk_upsert(&docs(2))
        .await
        .expect_err("Throttled batch should fail");
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_unavailable_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("no master"))
        .mount(&server)
        .await;

    let err = store_for(&[&server.uri()])
        .bulk_upsert(&docs(1))
        .await
        .expect_err("503 should fail");
    assert!(err.is_transient());
    assert!(err.to_string().contains("no master"));
}

#[tokio::test]
async fn test_bad_request_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("illegal_argument_exception"))
        .expect(1)
        .mount(&server)
        .await;

    let err = store_for(&[&server.uri()])
        .bulk_upsert(&docs(1))
        .await
        .expect_err("400 should fail");
    assert!(matches!(err, StoreError::Permanent(_)));
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Nothing listens on the discard port
    let err = store_for(&["http://127.0.0.1:9"])
        .bulk_upsert(&docs(1))
        .await
        .expect_err("Unreachable host should fail");
    assert!(err.is_transient());
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_fails_over_to_next_host() {
    let down = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&down)
        .await;

    let up = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": false,
            "items": [item(201)]
        })))
        .mount(&up)
        .await;

    let store = store_for(&[&down.uri(), &up.uri()]);
    for _ in 0..2 {
        let outcome = store
            .bulk_upsert(&docs(1))
            .await
            .expect("Healthy host should take the batch");
        assert_eq!(outcome.written, 1);
    }
}

#[tokio::test]
async fn test_permanent_error_does_not_fail_over() {
    let rejecting = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&rejecting)
        .await;

    let untouched = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&untouched)
        .await;

    let err = store_for(&[&rejecting.uri(), &untouched.uri()])
        .bulk_upsert(&docs(1))
        .await
        .expect_err("Rejected batch should fail");
    assert!(!err.is_transient());
}
