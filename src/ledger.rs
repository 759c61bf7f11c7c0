//! Position ledger derived from confirmed trades
//!
//! Holdings are mutated only here, and only by applying server-confirmed
//! trades: queued ones once acknowledged, and externally pushed ones.
//! Application is idempotent per dedup key, so a duplicate push after a
//! reconnect is a no-op.

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

use crate::errors::SyncError;
use crate::types::{Position, Side, Symbol, Trade};

#[derive(Default)]
pub struct PositionLedger {
    positions: HashMap<Symbol, Position>,
    /// Dedup keys of trades already applied
    applied: HashSet<String>,
    /// Symbols whose state is corrupt; further mutation is refused until
    /// the engine restarts
    poisoned: HashSet<Symbol>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a confirmed trade, returning the resulting position
    ///
    /// Weighted-average cost on buys; realized P&L against the average on
    /// sells. A sell exceeding the held quantity should have been rejected
    /// upstream, so hitting it here is an invariant violation: the symbol
    /// is poisoned and the position left untouched.
    pub fn apply(&mut self, trade: &Trade) -> Result<Position, SyncError> {
        if self.poisoned.contains(&trade.symbol) {
            return Err(SyncError::InternalInvariant(format!(
                "{} is frozen after a ledger invariant violation",
                trade.symbol
            )));
        }
        if trade.quantity == 0 {
            return Err(SyncError::InternalInvariant(format!(
                "confirmed trade for {} has zero quantity",
                trade.symbol
            )));
        }

        let dedup_key = trade.dedup_key();
        if let Some(key) = &dedup_key {
            if self.applied.contains(key) {
                debug!(symbol = %trade.symbol, key = %key, "duplicate trade ignored");
                return Ok(self.position_or_empty(&trade.symbol));
            }
        } else {
            warn!(symbol = %trade.symbol, "confirmed trade carries no dedup key");
        }

        let position = self
            .positions
            .entry(trade.symbol.clone())
            .or_insert_with(|| Position::new(trade.symbol.clone()));

        let quantity = Decimal::from(trade.quantity);
        match trade.side {
            Side::Buy => {
                let held = Decimal::from(position.quantity);
                let new_quantity = position.quantity + trade.quantity;
                position.average_cost = (held * position.average_cost + quantity * trade.price)
                    / Decimal::from(new_quantity);
                position.quantity = new_quantity;
            }
            Side::Sell => {
                if trade.quantity > position.quantity {
                    error!(
                        symbol = %trade.symbol,
                        held = position.quantity,
                        sold = trade.quantity,
                        "sell exceeds held quantity, freezing symbol"
                    );
                    self.poisoned.insert(trade.symbol.clone());
                    return Err(SyncError::InternalInvariant(format!(
                        "sell of {} units exceeds {} held for {}",
                        trade.quantity, position.quantity, trade.symbol
                    )));
                }
                position.realized_pnl += quantity * (trade.price - position.average_cost);
                position.quantity -= trade.quantity;
                if position.quantity == 0 {
                    position.average_cost = Decimal::ZERO;
                }
            }
        }

        if let Some(key) = dedup_key {
            self.applied.insert(key);
        }
        Ok(position.clone())
    }

    pub fn get(&self, symbol: &Symbol) -> Option<Position> {
        self.positions.get(symbol).cloned()
    }

    /// Snapshot of all positions, including flat ones with realized P&L
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Unrealized P&L for a symbol against the given market price
    pub fn unrealized_pnl(&self, symbol: &Symbol, current_price: Decimal) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.unrealized_pnl(current_price))
            .unwrap_or(Decimal::ZERO)
    }

    /// Quantity currently held for a symbol
    pub fn held_quantity(&self, symbol: &Symbol) -> u64 {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0)
    }

    /// Restore positions from a persisted snapshot
    pub fn restore(&mut self, positions: Vec<Position>) {
        for position in positions {
            self.positions.insert(position.symbol.clone(), position);
        }
    }

    fn position_or_empty(&self, symbol: &Symbol) -> Position {
        self.positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::new(symbol.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn trade(side: Side, quantity: u64, price: Decimal, fee: Decimal) -> Trade {
        Trade {
            symbol: Symbol::player("kohli"),
            side,
            quantity,
            price,
            fee,
            confirmed_at: Utc::now(),
            source_mutation_id: Some(Uuid::new_v4()),
            trade_id: None,
        }
    }

    #[test]
    fn weighted_average_cost_across_buys() {
        let mut ledger = PositionLedger::new();
        ledger.apply(&trade(Side::Buy, 10, dec!(100), dec!(10))).unwrap();
        let position = ledger.apply(&trade(Side::Buy, 10, dec!(120), dec!(12))).unwrap();

        assert_eq!(position.quantity, 20);
        assert_eq!(position.average_cost, dec!(110));
    }

    #[test]
    fn sell_realizes_pnl_against_average() {
        let mut ledger = PositionLedger::new();
        ledger.apply(&trade(Side::Buy, 10, dec!(100), dec!(10))).unwrap();
        ledger.apply(&trade(Side::Buy, 10, dec!(120), dec!(12))).unwrap();
        let position = ledger.apply(&trade(Side::Sell, 15, dec!(130), dec!(5))).unwrap();

        assert_eq!(position.quantity, 5);
        assert_eq!(position.average_cost, dec!(110));
        assert_eq!(position.realized_pnl, dec!(300));
    }

    #[test]
    fn selling_out_resets_average_cost() {
        let mut ledger = PositionLedger::new();
        ledger.apply(&trade(Side::Buy, 10, dec!(100), dec!(0))).unwrap();
        let position = ledger.apply(&trade(Side::Sell, 10, dec!(90), dec!(0))).unwrap();

        assert_eq!(position.quantity, 0);
        assert_eq!(position.average_cost, dec!(0));
        assert_eq!(position.realized_pnl, dec!(-100));
    }

    #[test]
    fn duplicate_apply_is_a_no_op() {
        let mut ledger = PositionLedger::new();
        let buy = trade(Side::Buy, 10, dec!(100), dec!(0));

        let first = ledger.apply(&buy).unwrap();
        let second = ledger.apply(&buy).unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.held_quantity(&Symbol::player("kohli")), 10);
    }

    #[test]
    fn oversell_poisons_the_symbol() {
        let mut ledger = PositionLedger::new();
        ledger.apply(&trade(Side::Buy, 5, dec!(100), dec!(0))).unwrap();

        let result = ledger.apply(&trade(Side::Sell, 6, dec!(100), dec!(0)));
        assert!(matches!(result, Err(SyncError::InternalInvariant(_))));

        // position untouched, further mutation refused
        assert_eq!(ledger.held_quantity(&Symbol::player("kohli")), 5);
        let result = ledger.apply(&trade(Side::Buy, 1, dec!(100), dec!(0)));
        assert!(matches!(result, Err(SyncError::InternalInvariant(_))));
    }

    #[test]
    fn quantity_never_goes_negative_across_sequences() {
        let mut ledger = PositionLedger::new();
        let sequence = [
            (Side::Buy, 3, dec!(50)),
            (Side::Sell, 1, dec!(55)),
            (Side::Buy, 2, dec!(60)),
            (Side::Sell, 4, dec!(52)),
        ];
        for (side, quantity, price) in sequence {
            let position = ledger.apply(&trade(side, quantity, price, dec!(0))).unwrap();
            assert!(position.quantity < u64::MAX);
            if position.quantity == 0 {
                assert_eq!(position.average_cost, dec!(0));
            }
        }
        assert_eq!(ledger.held_quantity(&Symbol::player("kohli")), 0);
    }

    #[test]
    fn unrealized_pnl_for_unknown_symbol_is_zero() {
        let ledger = PositionLedger::new();
        assert_eq!(
            ledger.unrealized_pnl(&Symbol::player("nobody"), dec!(100)),
            dec!(0)
        );
    }
}
