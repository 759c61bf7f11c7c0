//! Core data model shared across the engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Market symbol, either `PLAYER:<id>` or `MATCH:<id>`
///
/// Symbols key all per-instrument state: cache entries, positions and
/// subscription topics all use the same identifier space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Symbol for a raw identifier already carrying its prefix
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Symbol for a player stock
    pub fn player(id: &str) -> Self {
        Self(format!("PLAYER:{id}"))
    }

    /// Symbol for a match market
    pub fn match_market(id: &str) -> Self {
        Self(format!("MATCH:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trading side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[serde(alias = "buy")]
    Buy,
    #[serde(alias = "sell")]
    Sell,
}

/// Intraday trend figures carried alongside a price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTrend {
    pub open_price: Decimal,
    pub high: Decimal,
    pub low: Decimal,
}

/// Last-known market data for one symbol
///
/// Ticks are immutable once received; the cache replaces entries whole
/// rather than mutating them in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTick {
    pub symbol: Symbol,
    pub price: Decimal,
    pub trend: PriceTrend,
    #[serde(default)]
    pub volume: u64,
    pub received_at: DateTime<Utc>,
}

/// A server-confirmed trade
///
/// `source_mutation_id` links back to the queued mutation that caused the
/// trade; together with `trade_id` it forms the dedup key that makes
/// re-application after a duplicate push a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    #[serde(default = "Utc::now")]
    pub confirmed_at: DateTime<Utc>,
    #[serde(default)]
    pub source_mutation_id: Option<Uuid>,
    #[serde(default)]
    pub trade_id: Option<String>,
}

impl Trade {
    /// Key used to detect duplicate application of the same confirmed trade
    pub fn dedup_key(&self) -> Option<String> {
        self.source_mutation_id
            .map(|id| format!("mutation:{id}"))
            .or_else(|| self.trade_id.as_ref().map(|id| format!("trade:{id}")))
    }
}

/// Per-symbol holding derived from confirmed trades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: u64,
    pub average_cost: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            quantity: 0,
            average_cost: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
        }
    }

    /// Unrealized P&L of the open quantity against the given market price
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        Decimal::from(self.quantity) * (current_price - self.average_cost)
    }

    /// Value of the open quantity at the given market price
    pub fn market_value(&self, current_price: Decimal) -> Decimal {
        Decimal::from(self.quantity) * current_price
    }
}

/// Last confirmed wallet balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub user_id: String,
    pub available: Decimal,
    pub locked: Decimal,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Streaming connection lifecycle
///
/// Transitions are driven only by the connection manager; everyone else
/// observes snapshots through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Reconnect attempts exhausted; distinct from a requested disconnect,
    /// and only a manual `connect()` leaves this state
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt, .. } => {
                write!(f, "reconnecting (attempt {attempt})")
            }
            ConnectionState::Failed => write!(f, "failed (reconnect attempts exhausted)"),
        }
    }
}
