//! TTL-bounded cache of last-known market data per symbol
//!
//! Fed by the streaming feed, read by the ledger and the UI. Entries are
//! replaced whole (last-write-wins per symbol); expiry is checked
//! opportunistically on `get` and in bulk via `evict_expired`. A size
//! ceiling evicts oldest-by-receipt entries; hot symbols are re-inserted
//! by the stream anyway.

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::store::JsonStore;
use crate::types::{MarketTick, Symbol};
use std::collections::HashMap;

const SNAPSHOT_NAMESPACE: &str = "market_cache";

pub struct MarketDataCache {
    entries: HashMap<Symbol, MarketTick>,
    ttl: Duration,
    max_entries: usize,
    store: Option<JsonStore>,
}

impl MarketDataCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Duration::seconds(config.ttl_secs as i64),
            max_entries: config.max_entries,
            store: None,
        }
    }

    /// Cache backed by the given store, restoring the last snapshot
    pub fn open(config: &CacheConfig, store: JsonStore) -> Self {
        let mut cache = Self::new(config);
        if let Some(ticks) = store.load::<Vec<MarketTick>>(SNAPSHOT_NAMESPACE) {
            let now = Utc::now();
            for tick in ticks {
                if tick.received_at + cache.ttl > now {
                    cache.entries.insert(tick.symbol.clone(), tick);
                }
            }
            debug!(entries = cache.entries.len(), "market cache restored");
        }
        cache.store = Some(store);
        cache
    }

    /// Last-known tick for a symbol, unless it has expired
    pub fn get(&mut self, symbol: &Symbol) -> Option<MarketTick> {
        let expired = match self.entries.get(symbol) {
            Some(tick) => tick.received_at + self.ttl <= Utc::now(),
            None => return None,
        };
        if expired {
            self.entries.remove(symbol);
            return None;
        }
        self.entries.get(symbol).cloned()
    }

    /// Insert or replace the entry for a tick's symbol
    pub fn put(&mut self, tick: MarketTick) {
        self.entries.insert(tick.symbol.clone(), tick);
        self.enforce_ceiling();
    }

    /// Drop the entry for a symbol, e.g. after a trade confirmation makes
    /// the cached price suspect
    pub fn invalidate(&mut self, symbol: &Symbol) {
        self.entries.remove(symbol);
    }

    /// Drop all expired entries; returns how many were removed
    pub fn evict_expired(&mut self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, tick| tick.received_at + ttl > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the current entries so they survive a restart
    pub fn save_snapshot(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let ticks: Vec<&MarketTick> = self.entries.values().collect();
        if let Err(err) = store.save(SNAPSHOT_NAMESPACE, &ticks) {
            warn!(error = %err, "failed to persist market cache snapshot");
        }
    }

    fn enforce_ceiling(&mut self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .values()
                .min_by_key(|tick| tick.received_at)
                .map(|tick| tick.symbol.clone());
            match oldest {
                Some(symbol) => {
                    debug!(symbol = %symbol, "evicting oldest entry over size ceiling");
                    self.entries.remove(&symbol);
                }
                None => break,
            }
        }
    }
}
