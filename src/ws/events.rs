//! Wire frames for the streaming feed
//!
//! Client→server control frames carry subscription changes; server→client
//! frames carry market and transaction updates. Unknown frame types are
//! ignored rather than treated as fatal, so the server can add frames
//! without breaking older clients.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{MarketTick, PriceTrend, Symbol, Trade};

pub const FRAME_MATCH_UPDATE: &str = "MATCH_UPDATE";
pub const FRAME_PLAYER_PRICE_UPDATE: &str = "PLAYER_PRICE_UPDATE";
pub const FRAME_TRANSACTION_UPDATE: &str = "TRANSACTION_UPDATE";

#[derive(Error, Debug)]
pub enum EventError {
    #[error("invalid {frame_type} payload: {reason}")]
    InvalidPayload { frame_type: String, reason: String },
}

/// Client→server control frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub frame_type: ControlType,
    /// Topics, in the order they were subscribed
    pub payload: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    Subscribe,
    Unsubscribe,
}

impl ControlFrame {
    pub fn subscribe(topics: Vec<String>) -> Self {
        Self {
            frame_type: ControlType::Subscribe,
            payload: topics,
        }
    }

    pub fn unsubscribe(topics: Vec<String>) -> Self {
        Self {
            frame_type: ControlType::Unsubscribe,
            payload: topics,
        }
    }
}

/// Raw server→client frame envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Typed events published to engine consumers
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum FeedEvent {
    MatchUpdate(MarketTick),
    PlayerPriceUpdate(MarketTick),
    TransactionUpdate(Trade),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchUpdatePayload {
    match_id: String,
    price: Decimal,
    open_price: Decimal,
    high: Decimal,
    low: Decimal,
    #[serde(default)]
    volume: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerPriceUpdatePayload {
    player_id: String,
    price: Decimal,
    open_price: Decimal,
    high: Decimal,
    low: Decimal,
    #[serde(default)]
    volume: u64,
}

/// Parse a server frame into a typed event
///
/// `Ok(None)` means the frame type is unknown and should be skipped.
pub fn parse_frame(frame: &WireFrame) -> Result<Option<FeedEvent>, EventError> {
    match frame.frame_type.as_str() {
        FRAME_MATCH_UPDATE => {
            let tick = parse_match_update(&frame.payload)?;
            Ok(Some(FeedEvent::MatchUpdate(tick)))
        }
        FRAME_PLAYER_PRICE_UPDATE => {
            let tick = parse_player_price_update(&frame.payload)?;
            Ok(Some(FeedEvent::PlayerPriceUpdate(tick)))
        }
        FRAME_TRANSACTION_UPDATE => {
            let trade = parse_transaction(&frame.payload)?;
            Ok(Some(FeedEvent::TransactionUpdate(trade)))
        }
        _ => Ok(None),
    }
}

/// Parse a match-update payload into a tick for `MATCH:<id>`
///
/// Also used for items returned by `GET /matches/sync`.
pub fn parse_match_update(payload: &serde_json::Value) -> Result<MarketTick, EventError> {
    let parsed: MatchUpdatePayload =
        serde_json::from_value(payload.clone()).map_err(|err| EventError::InvalidPayload {
            frame_type: FRAME_MATCH_UPDATE.to_string(),
            reason: err.to_string(),
        })?;
    Ok(MarketTick {
        symbol: Symbol::match_market(&parsed.match_id),
        price: parsed.price,
        trend: PriceTrend {
            open_price: parsed.open_price,
            high: parsed.high,
            low: parsed.low,
        },
        volume: parsed.volume,
        received_at: Utc::now(),
    })
}

/// Parse a player-price payload into a tick for `PLAYER:<id>`
///
/// Also used for items returned by `GET /players/sync`.
pub fn parse_player_price_update(payload: &serde_json::Value) -> Result<MarketTick, EventError> {
    let parsed: PlayerPriceUpdatePayload =
        serde_json::from_value(payload.clone()).map_err(|err| EventError::InvalidPayload {
            frame_type: FRAME_PLAYER_PRICE_UPDATE.to_string(),
            reason: err.to_string(),
        })?;
    Ok(MarketTick {
        symbol: Symbol::player(&parsed.player_id),
        price: parsed.price,
        trend: PriceTrend {
            open_price: parsed.open_price,
            high: parsed.high,
            low: parsed.low,
        },
        volume: parsed.volume,
        received_at: Utc::now(),
    })
}

/// Parse a transaction payload into a confirmed trade
///
/// Also used for items returned by `GET /transactions/sync`.
pub fn parse_transaction(payload: &serde_json::Value) -> Result<Trade, EventError> {
    serde_json::from_value(payload.clone()).map_err(|err| EventError::InvalidPayload {
        frame_type: FRAME_TRANSACTION_UPDATE.to_string(),
        reason: err.to_string(),
    })
}
