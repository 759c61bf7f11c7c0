//! Typed REST client for the trading API
//!
//! Every mutating call carries the mutation's id as an idempotency key, so
//! a replay after reconnect is deduplicated server-side. HTTP failures are
//! classified into the engine's error taxonomy here, in one place.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::SyncError;
use crate::types::{Side, Symbol, Trade, WalletBalance};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Market trade request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    /// Price the client saw at placement; the server fills at its own
    /// price and the confirmation is authoritative
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub limit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub stop_price: Decimal,
}

/// Acknowledgement for a resting order; carries a fill when the order
/// executed immediately
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
    #[serde(default)]
    pub fill: Option<Trade>,
}

/// One page of authoritative state for an entity type
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage {
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    /// Cursor to persist once the page has been applied
    pub watermark: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WalletOpBody<'a> {
    user_id: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub async fn place_trade(
        &self,
        request: &TradeRequest,
        idempotency_key: Uuid,
    ) -> Result<Trade, SyncError> {
        let response = self
            .http
            .post(format!("{}/trade", self.base_url))
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(request)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn place_limit_order(
        &self,
        request: &LimitOrderRequest,
        idempotency_key: Uuid,
    ) -> Result<OrderAck, SyncError> {
        let response = self
            .http
            .post(format!("{}/orders/limit", self.base_url))
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(request)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn place_stop_order(
        &self,
        request: &StopOrderRequest,
        idempotency_key: Uuid,
    ) -> Result<OrderAck, SyncError> {
        let response = self
            .http
            .post(format!("{}/orders/stop", self.base_url))
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(request)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn cancel_order(
        &self,
        order_id: &str,
        idempotency_key: Uuid,
    ) -> Result<(), SyncError> {
        let response = self
            .http
            .delete(format!("{}/orders/{}", self.base_url, order_id))
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    pub async fn wallet(&self, user_id: &str) -> Result<WalletBalance, SyncError> {
        let response = self
            .http
            .get(format!("{}/wallet/{}", self.base_url, user_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn deposit(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: Uuid,
    ) -> Result<WalletBalance, SyncError> {
        self.wallet_op("deposit", user_id, amount, idempotency_key).await
    }

    pub async fn withdraw(
        &self,
        user_id: &str,
        amount: Decimal,
        idempotency_key: Uuid,
    ) -> Result<WalletBalance, SyncError> {
        self.wallet_op("withdraw", user_id, amount, idempotency_key).await
    }

    async fn wallet_op(
        &self,
        op: &str,
        user_id: &str,
        amount: Decimal,
        idempotency_key: Uuid,
    ) -> Result<WalletBalance, SyncError> {
        let response = self
            .http
            .post(format!("{}/wallet/{}", self.base_url, op))
            .bearer_auth(&self.token)
            .header(IDEMPOTENCY_HEADER, idempotency_key.to_string())
            .json(&WalletOpBody { user_id, amount })
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// Pull authoritative state for an entity type changed since the
    /// given watermark
    pub async fn sync_since(
        &self,
        entity: &str,
        since: DateTime<Utc>,
    ) -> Result<SyncPage, SyncError> {
        let response = self
            .http
            .get(format!("{}/{}/sync", self.base_url, entity))
            .query(&[("since", since.to_rfc3339())])
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }
}

/// Map an HTTP response onto the error taxonomy
async fn check(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs);

    let message = match response.text().await {
        Ok(body) if !body.is_empty() => serde_json::from_str::<ErrorBody>(&body)
            .map(|e| e.error)
            .unwrap_or(body),
        _ => status.to_string(),
    };

    Err(match status.as_u16() {
        401 | 403 => SyncError::Auth(message),
        429 => SyncError::RateLimited { retry_after },
        400..=499 => SyncError::Validation(message),
        _ => SyncError::Connectivity(format!("server error {status}: {message}")),
    })
}
