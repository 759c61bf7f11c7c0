//! REST client endpoint coverage and error classification

use std::time::Duration;

use chrono::{TimeZone, Utc};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crickstox::rest::{RestClient, TradeRequest};
use crickstox::types::{Side, Symbol};
use crickstox::SyncError;

fn trade_request() -> TradeRequest {
    TradeRequest {
        symbol: Symbol::player("kohli"),
        side: Side::Buy,
        quantity: 5,
        price: dec!(100),
    }
}

#[tokio::test]
async fn unauthorized_maps_to_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/trade"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "session expired"})))
        .mount(&server)
        .await;

    let client = RestClient::new(server.uri(), "stale-token");
    let err = client
        .place_trade(&trade_request(), Uuid::new_v4())
        .await
        .unwrap_err();
    match err {
        SyncError::Auth(reason) => assert_eq!(reason, "session expired"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn too_many_requests_maps_to_rate_limited_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/trade"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;

    let client = RestClient::new(server.uri(), "token");
    let err = client
        .place_trade(&trade_request(), Uuid::new_v4())
        .await
        .unwrap_err();
    match err {
        SyncError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Some(Duration::from_secs(30)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn client_errors_map_to_validation_with_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/trade"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"error": "insufficient balance"})),
        )
        .mount(&server)
        .await;

    let client = RestClient::new(server.uri(), "token");
    let err = client
        .place_trade(&trade_request(), Uuid::new_v4())
        .await
        .unwrap_err();
    match err {
        SyncError::Validation(reason) => assert_eq!(reason, "insufficient balance"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_map_to_connectivity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/trade"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = RestClient::new(server.uri(), "token");
    let err = client
        .place_trade(&trade_request(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Connectivity(_)));
    assert!(err.halts_drain());
}

#[tokio::test]
async fn cancel_order_sends_idempotency_key() {
    let server = MockServer::start().await;
    let key = Uuid::new_v4();
    Mock::given(method("DELETE"))
        .and(path("/orders/o-42"))
        .and(header("Idempotency-Key", key.to_string().as_str()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = RestClient::new(server.uri(), "token");
    client.cancel_order("o-42", key).await.unwrap();
}

#[tokio::test]
async fn wallet_fetch_deserializes_balance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wallet/user-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "userId": "user-1",
            "available": 2500.0,
            "locked": 150.0
        })))
        .mount(&server)
        .await;

    let client = RestClient::new(server.uri(), "token");
    let balance = client.wallet("user-1").await.unwrap();
    assert_eq!(balance.user_id, "user-1");
    assert_eq!(balance.available, dec!(2500));
    assert_eq!(balance.locked, dec!(150));
}

#[tokio::test]
async fn sync_pull_passes_watermark_and_parses_page() {
    let server = MockServer::start().await;
    let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    Mock::given(method("GET"))
        .and(path("/players/sync"))
        .and(query_param("since", since.to_rfc3339().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"playerId": "kohli", "price": 104.5, "openPrice": 100.0, "high": 106.0, "low": 99.0}
            ],
            "watermark": "2026-01-02T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let client = RestClient::new(server.uri(), "token");
    let page = client.sync_since("players", since).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.watermark, Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap());
}
