//! Sync engine: the orchestrator tying queue, ledger, cache and network
//! together
//!
//! Drains the mutation queue when connectivity allows, merges confirmed
//! results back into local state, and reconciles server-side changes
//! through watermarked sync pulls. Consumers observe the engine through a
//! broadcast of [`EngineEvent`]s and a watch of the connection state; they
//! read snapshots and never mutate engine state directly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::data_paths::DataPaths;
use crate::errors::SyncError;
use crate::ledger::PositionLedger;
use crate::market_data::MarketDataCache;
use crate::queue::{MutationKind, MutationQueue, MutationRecord};
use crate::rate_limit::RateLimiter;
use crate::rest::{LimitOrderRequest, OrderAck, RestClient, StopOrderRequest, TradeRequest};
use crate::store::JsonStore;
use crate::types::{
    ConnectionState, MarketTick, Position, Side, Symbol, Trade, WalletBalance,
};
use crate::ws::events::{
    parse_match_update, parse_player_price_update, parse_transaction, FeedEvent,
};
use crate::ws::{ConnectionManager, SubscriptionHandle};

/// Mutation entities understood by the drain dispatcher
pub const ENTITY_TRADE: &str = "trade";
pub const ENTITY_ORDER_LIMIT: &str = "order:limit";
pub const ENTITY_ORDER_STOP: &str = "order:stop";
pub const ENTITY_ORDER_CANCEL: &str = "order:cancel";
pub const ENTITY_WALLET_DEPOSIT: &str = "wallet:deposit";
pub const ENTITY_WALLET_WITHDRAW: &str = "wallet:withdraw";

/// Entity types pulled during a full sync, in pull order
const SYNC_ENTITIES: [&str; 3] = ["matches", "players", "transactions"];

const WATERMARKS_NAMESPACE: &str = "watermarks";
const POSITIONS_NAMESPACE: &str = "positions";

/// Rate-limit key shared by all queued-mutation dispatches
const MUTATION_RATE_KEY: &str = "mutation";
const WALLET_RATE_KEY: &str = "wallet";

/// Events published to engine observers
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum EngineEvent {
    ConnectionChanged(ConnectionState),
    TickReceived(MarketTick),
    MutationEnqueued { id: Uuid },
    MutationConfirmed { id: Uuid },
    /// Permanent failure: validation rejection or retry exhaustion
    MutationFailed { id: Uuid, reason: String },
    PositionChanged(Position),
    WalletChanged(WalletBalance),
    /// 401-class failure; the session must be re-established above the
    /// engine
    SessionInvalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrderPayload {
    order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletOpPayload {
    amount: Decimal,
}

enum DispatchOutcome {
    Trade(Trade),
    Order(OrderAck),
    Wallet(WalletBalance),
    Cancelled,
}

/// One engine instance per app session; everything constructor-injected,
/// no global state. Cloning yields another handle to the same instance.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<EngineConfig>,
    user_id: String,
    conn: Arc<ConnectionManager>,
    rest: Arc<RestClient>,
    queue: Arc<Mutex<MutationQueue>>,
    ledger: Arc<RwLock<PositionLedger>>,
    cache: Arc<RwLock<MarketDataCache>>,
    limiter: Arc<Mutex<RateLimiter>>,
    wallet: Arc<RwLock<Option<WalletBalance>>>,
    watermarks: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
    sync_store: JsonStore,
    events: broadcast::Sender<EngineEvent>,
    /// Concurrent drain calls collapse into the in-progress run
    draining: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl SyncEngine {
    /// Build an engine from configuration; nothing touches the network
    /// until `connect()`
    pub fn new(
        config: EngineConfig,
        data_paths: &DataPaths,
        token: &str,
        user_id: &str,
    ) -> anyhow::Result<Self> {
        data_paths.ensure_directories()?;

        let queue_store = JsonStore::new(data_paths.queue());
        let cache_store = JsonStore::new(data_paths.cache());
        let sync_store = JsonStore::new(data_paths.sync());

        let conn = ConnectionManager::new(&config.ws_url, token, config.reconnect.clone())?;
        let rest = RestClient::new(&config.rest_base_url, token);

        let queue = MutationQueue::open(queue_store);
        let cache = MarketDataCache::open(&config.cache, cache_store);
        let mut ledger = PositionLedger::new();
        if let Some(positions) = sync_store.load::<Vec<Position>>(POSITIONS_NAMESPACE) {
            ledger.restore(positions);
        }
        let watermarks: HashMap<String, DateTime<Utc>> =
            sync_store.load(WATERMARKS_NAMESPACE).unwrap_or_default();
        let limiter = RateLimiter::new(config.rate_limit.clone());

        let (events, _) = broadcast::channel(1024);

        Ok(Self {
            config: Arc::new(config),
            user_id: user_id.to_string(),
            conn: Arc::new(conn),
            rest: Arc::new(rest),
            queue: Arc::new(Mutex::new(queue)),
            ledger: Arc::new(RwLock::new(ledger)),
            cache: Arc::new(RwLock::new(cache)),
            limiter: Arc::new(Mutex::new(limiter)),
            wallet: Arc::new(RwLock::new(None)),
            watermarks: Arc::new(Mutex::new(watermarks)),
            sync_store,
            events,
            draining: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Spawn the background tasks: feed consumer, connectivity watcher and
    /// the periodic drain/sync safety net
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            debug!("engine already started");
            return;
        }

        // Feed consumer: ticks into the cache, pushed transactions into
        // the ledger
        let engine = self.clone();
        let mut feed = self.conn.events();
        tasks.push(tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(FeedEvent::PlayerPriceUpdate(tick)) | Ok(FeedEvent::MatchUpdate(tick)) => {
                        engine.apply_tick(tick).await;
                    }
                    Ok(FeedEvent::TransactionUpdate(trade)) => {
                        engine.apply_trade(trade).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "feed consumer lagged, scheduling full sync");
                        engine.sync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Connectivity watcher: pause admission while offline, drain and
        // sync on every reconnect
        let engine = self.clone();
        let mut state_rx = self.conn.state();
        tasks.push(tokio::spawn(async move {
            let mut previous = *state_rx.borrow();
            loop {
                if state_rx.changed().await.is_err() {
                    break;
                }
                let state = *state_rx.borrow();
                engine.emit(EngineEvent::ConnectionChanged(state));
                engine.limiter.lock().await.set_paused(!state.is_connected());
                if state.is_connected() && !previous.is_connected() {
                    info!("connectivity regained, draining queue");
                    engine.drain().await;
                    engine.sync().await;
                }
                previous = state;
            }
        }));

        // Periodic safety net against missed drain triggers
        let engine = self.clone();
        let period = Duration::from_secs(self.config.sync_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.cache.write().await.evict_expired();
                engine.drain().await;
                engine.sync().await;
            }
        }));
    }

    /// Stop background tasks, close the feed and persist snapshots
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Err(err) = self.conn.disconnect() {
            debug!(error = %err, "feed already gone at shutdown");
        }
        self.cache.read().await.save_snapshot();
        self.persist_positions().await;
        info!("engine shut down");
    }

    // ---- connectivity -----------------------------------------------------

    pub fn connect(&self) -> Result<(), SyncError> {
        self.conn.connect().map_err(SyncError::from)
    }

    pub fn disconnect(&self) -> Result<(), SyncError> {
        self.conn.disconnect().map_err(SyncError::from)
    }

    pub fn subscribe(&self, topic: impl Into<String>) -> Result<SubscriptionHandle, SyncError> {
        self.conn.subscribe(topic).map_err(SyncError::from)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), SyncError> {
        self.conn.unsubscribe(handle).map_err(SyncError::from)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.current_state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.conn.state()
    }

    /// Receiver for engine events; late subscribers only see events from
    /// now on
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// App came back to the foreground: reconnect if needed and catch up
    pub async fn on_foreground(&self) -> Result<(), SyncError> {
        if !self.connection_state().is_connected() {
            self.connect()?;
        }
        self.drain().await;
        self.sync().await;
        Ok(())
    }

    // ---- mutations --------------------------------------------------------

    /// Queue a market trade; delivered exactly once when connectivity
    /// allows
    pub async fn place_trade(
        &self,
        symbol: Symbol,
        side: Side,
        quantity: u64,
        price: Decimal,
    ) -> Result<Uuid, SyncError> {
        if quantity == 0 {
            return Err(SyncError::Validation("quantity must be positive".into()));
        }
        if side == Side::Sell {
            self.check_sell_quantity(&symbol, quantity).await?;
        }

        let request = TradeRequest {
            symbol,
            side,
            quantity,
            price,
        };
        self.enqueue_mutation(MutationKind::Create, ENTITY_TRADE, &request)
            .await
    }

    /// Queue a limit order
    ///
    /// The price sanity check against the cached market price is advisory
    /// only; the server's confirmation is the source of truth.
    pub async fn place_limit_order(
        &self,
        symbol: Symbol,
        side: Side,
        quantity: u64,
        limit_price: Decimal,
    ) -> Result<Uuid, SyncError> {
        if quantity == 0 {
            return Err(SyncError::Validation("quantity must be positive".into()));
        }
        if side == Side::Sell {
            self.check_sell_quantity(&symbol, quantity).await?;
        }
        if let Some(tick) = self.tick(&symbol).await {
            match side {
                Side::Buy if limit_price >= tick.price => {
                    warn!(%symbol, %limit_price, market = %tick.price, "limit buy at or above market");
                }
                Side::Sell if limit_price <= tick.price => {
                    warn!(%symbol, %limit_price, market = %tick.price, "limit sell at or below market");
                }
                _ => {}
            }
        }

        let request = LimitOrderRequest {
            symbol,
            side,
            quantity,
            limit_price,
        };
        self.enqueue_mutation(MutationKind::Create, ENTITY_ORDER_LIMIT, &request)
            .await
    }

    /// Queue a stop order
    pub async fn place_stop_order(
        &self,
        symbol: Symbol,
        side: Side,
        quantity: u64,
        stop_price: Decimal,
    ) -> Result<Uuid, SyncError> {
        if quantity == 0 {
            return Err(SyncError::Validation("quantity must be positive".into()));
        }
        if side == Side::Sell {
            self.check_sell_quantity(&symbol, quantity).await?;
        }

        let request = StopOrderRequest {
            symbol,
            side,
            quantity,
            stop_price,
        };
        self.enqueue_mutation(MutationKind::Create, ENTITY_ORDER_STOP, &request)
            .await
    }

    /// Queue a cancellation for a resting order
    pub async fn cancel_order(&self, order_id: impl Into<String>) -> Result<Uuid, SyncError> {
        let payload = CancelOrderPayload {
            order_id: order_id.into(),
        };
        self.enqueue_mutation(MutationKind::Delete, ENTITY_ORDER_CANCEL, &payload)
            .await
    }

    /// Queue a wallet deposit
    pub async fn deposit(&self, amount: Decimal) -> Result<Uuid, SyncError> {
        if amount <= Decimal::ZERO {
            return Err(SyncError::Validation("amount must be positive".into()));
        }
        self.enqueue_mutation(
            MutationKind::Create,
            ENTITY_WALLET_DEPOSIT,
            &WalletOpPayload { amount },
        )
        .await
    }

    /// Queue a wallet withdrawal
    pub async fn withdraw(&self, amount: Decimal) -> Result<Uuid, SyncError> {
        if amount <= Decimal::ZERO {
            return Err(SyncError::Validation("amount must be positive".into()));
        }
        self.enqueue_mutation(
            MutationKind::Create,
            ENTITY_WALLET_WITHDRAW,
            &WalletOpPayload { amount },
        )
        .await
    }

    /// Cancel a queued mutation; only possible before it goes in flight
    pub async fn cancel_mutation(&self, id: Uuid) -> bool {
        self.queue.lock().await.cancel(id)
    }

    pub async fn pending_mutations(&self) -> Vec<MutationRecord> {
        self.queue.lock().await.pending()
    }

    pub async fn failed_mutations(&self) -> Vec<MutationRecord> {
        self.queue.lock().await.failed()
    }

    // ---- snapshots --------------------------------------------------------

    pub async fn positions(&self) -> Vec<Position> {
        self.ledger.read().await.positions()
    }

    pub async fn position(&self, symbol: &Symbol) -> Option<Position> {
        self.ledger.read().await.get(symbol)
    }

    pub async fn tick(&self, symbol: &Symbol) -> Option<MarketTick> {
        self.cache.write().await.get(symbol)
    }

    /// Unrealized P&L against the cached market price, when one is known
    pub async fn unrealized_pnl(&self, symbol: &Symbol) -> Option<Decimal> {
        let tick = self.tick(symbol).await?;
        Some(self.ledger.read().await.unrealized_pnl(symbol, tick.price))
    }

    pub async fn wallet_balance(&self) -> Option<WalletBalance> {
        self.wallet.read().await.clone()
    }

    /// Fetch the authoritative wallet balance; rate-limit denials are
    /// dropped, not queued, since the cached balance stays usable
    pub async fn refresh_wallet(&self) -> Result<WalletBalance, SyncError> {
        {
            let mut limiter = self.limiter.lock().await;
            if !limiter.try_admit(WALLET_RATE_KEY) {
                let wait = limiter.time_until_reset(WALLET_RATE_KEY);
                return Err(SyncError::RateLimited {
                    retry_after: Some(wait),
                });
            }
            limiter.record_admission(WALLET_RATE_KEY);
        }
        let balance = self.rest.wallet(&self.user_id).await?;
        *self.wallet.write().await = Some(balance.clone());
        self.emit(EngineEvent::WalletChanged(balance.clone()));
        Ok(balance)
    }

    // ---- drain ------------------------------------------------------------

    /// Deliver pending mutations in enqueue order
    ///
    /// Idempotent and safe to call concurrently with itself: a drain
    /// already in progress makes this a no-op. Runs only while connected.
    pub async fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("drain already in progress");
            return;
        }
        self.drain_inner().await;
        self.draining.store(false, Ordering::SeqCst);
    }

    async fn drain_inner(&self) {
        if !self.connection_state().is_connected() {
            debug!("not connected, skipping drain");
            return;
        }

        let pending = self.queue.lock().await.pending();
        if pending.is_empty() {
            return;
        }
        debug!(pending = pending.len(), "draining mutation queue");

        for record in pending {
            if !self.connection_state().is_connected() {
                break;
            }
            if record.attempts >= self.config.queue.max_retries {
                let reason = format!(
                    "gave up after {} attempts: {}",
                    record.attempts,
                    record.last_error.as_deref().unwrap_or("unknown error")
                );
                self.queue
                    .lock()
                    .await
                    .mark_failed_permanent(record.id, &reason);
                self.emit(EngineEvent::MutationFailed {
                    id: record.id,
                    reason,
                });
                continue;
            }

            {
                let mut limiter = self.limiter.lock().await;
                if !limiter.try_admit(MUTATION_RATE_KEY) {
                    debug!(
                        wait = ?limiter.time_until_reset(MUTATION_RATE_KEY),
                        "rate limit reached, pausing drain"
                    );
                    break;
                }
                limiter.record_admission(MUTATION_RATE_KEY);
            }

            // The record may have been cancelled since the snapshot was
            // taken; a cancelled mutation must never reach the network
            if !self.queue.lock().await.mark_in_flight(record.id) {
                debug!(id = %record.id, "record no longer pending, skipping dispatch");
                continue;
            }
            match self.dispatch(&record).await {
                Ok(outcome) => {
                    self.queue.lock().await.complete(record.id);
                    self.apply_outcome(outcome).await;
                    self.emit(EngineEvent::MutationConfirmed { id: record.id });
                }
                Err(err) if err.halts_drain() => {
                    // Affects every record equally; retrying the rest now
                    // would only burn their retry budgets
                    warn!(id = %record.id, error = %err, "drain halted");
                    self.queue
                        .lock()
                        .await
                        .record_failure(record.id, &err.to_string());
                    if let SyncError::Auth(reason) = &err {
                        self.emit(EngineEvent::SessionInvalid {
                            reason: reason.clone(),
                        });
                    }
                    break;
                }
                Err(err) => {
                    // Mutation-specific; must not block the rest of the
                    // queue
                    let reason = err.to_string();
                    warn!(id = %record.id, error = %reason, "mutation permanently failed");
                    self.queue
                        .lock()
                        .await
                        .mark_failed_permanent(record.id, &reason);
                    self.emit(EngineEvent::MutationFailed {
                        id: record.id,
                        reason,
                    });
                }
            }
        }

        self.persist_positions().await;
    }

    async fn dispatch(&self, record: &MutationRecord) -> Result<DispatchOutcome, SyncError> {
        match record.entity.as_str() {
            ENTITY_TRADE => {
                let request: TradeRequest = parse_payload(record)?;
                let trade = self.rest.place_trade(&request, record.id).await?;
                Ok(DispatchOutcome::Trade(trade))
            }
            ENTITY_ORDER_LIMIT => {
                let request: LimitOrderRequest = parse_payload(record)?;
                let ack = self.rest.place_limit_order(&request, record.id).await?;
                Ok(DispatchOutcome::Order(ack))
            }
            ENTITY_ORDER_STOP => {
                let request: StopOrderRequest = parse_payload(record)?;
                let ack = self.rest.place_stop_order(&request, record.id).await?;
                Ok(DispatchOutcome::Order(ack))
            }
            ENTITY_ORDER_CANCEL => {
                let payload: CancelOrderPayload = parse_payload(record)?;
                self.rest.cancel_order(&payload.order_id, record.id).await?;
                Ok(DispatchOutcome::Cancelled)
            }
            ENTITY_WALLET_DEPOSIT => {
                let payload: WalletOpPayload = parse_payload(record)?;
                let balance = self
                    .rest
                    .deposit(&self.user_id, payload.amount, record.id)
                    .await?;
                Ok(DispatchOutcome::Wallet(balance))
            }
            ENTITY_WALLET_WITHDRAW => {
                let payload: WalletOpPayload = parse_payload(record)?;
                let balance = self
                    .rest
                    .withdraw(&self.user_id, payload.amount, record.id)
                    .await?;
                Ok(DispatchOutcome::Wallet(balance))
            }
            other => Err(SyncError::Validation(format!(
                "unknown mutation entity: {other}"
            ))),
        }
    }

    async fn apply_outcome(&self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Trade(trade) => self.apply_trade(trade).await,
            DispatchOutcome::Order(ack) => {
                if let Some(fill) = ack.fill {
                    self.apply_trade(fill).await;
                }
            }
            DispatchOutcome::Wallet(balance) => {
                *self.wallet.write().await = Some(balance.clone());
                self.emit(EngineEvent::WalletChanged(balance));
            }
            DispatchOutcome::Cancelled => {}
        }
    }

    // ---- full sync --------------------------------------------------------

    /// Pull authoritative state for each entity type since its watermark
    ///
    /// Reconciles changes that happened purely server-side, e.g. another
    /// device's trade. Watermarks advance only after a page was applied;
    /// losing them degrades to a full re-pull, never to inconsistency.
    pub async fn sync(&self) {
        for entity in SYNC_ENTITIES {
            let since = self
                .watermarks
                .lock()
                .await
                .get(entity)
                .copied()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

            let page = match self.rest.sync_since(entity, since).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(entity, error = %err, "sync pull failed");
                    if err.halts_drain() {
                        break;
                    }
                    continue;
                }
            };

            let applied = self.apply_sync_items(entity, &page.items).await;
            debug!(entity, items = page.items.len(), applied, "sync page applied");

            let mut watermarks = self.watermarks.lock().await;
            watermarks.insert(entity.to_string(), page.watermark);
            if let Err(err) = self.sync_store.save(WATERMARKS_NAMESPACE, &*watermarks) {
                warn!(error = %err, "failed to persist watermarks");
            }
        }

        self.cache.read().await.save_snapshot();
        self.persist_positions().await;
    }

    async fn apply_sync_items(&self, entity: &str, items: &[serde_json::Value]) -> usize {
        let mut applied = 0;
        for item in items {
            let ok = match entity {
                "matches" => match parse_match_update(item) {
                    Ok(tick) => {
                        self.apply_tick(tick).await;
                        true
                    }
                    Err(err) => {
                        warn!(entity, error = %err, "skipping unparseable sync item");
                        false
                    }
                },
                "players" => match parse_player_price_update(item) {
                    Ok(tick) => {
                        self.apply_tick(tick).await;
                        true
                    }
                    Err(err) => {
                        warn!(entity, error = %err, "skipping unparseable sync item");
                        false
                    }
                },
                "transactions" => match parse_transaction(item) {
                    Ok(trade) => {
                        self.apply_trade(trade).await;
                        true
                    }
                    Err(err) => {
                        warn!(entity, error = %err, "skipping unparseable sync item");
                        false
                    }
                },
                _ => false,
            };
            if ok {
                applied += 1;
            }
        }
        applied
    }

    // ---- internals --------------------------------------------------------

    async fn apply_tick(&self, tick: MarketTick) {
        self.cache.write().await.put(tick.clone());
        self.emit(EngineEvent::TickReceived(tick));
    }

    async fn apply_trade(&self, trade: Trade) {
        let result = self.ledger.write().await.apply(&trade);
        match result {
            Ok(position) => {
                // The cached price predates the fill; drop it and let the
                // stream re-populate
                self.cache.write().await.invalidate(&trade.symbol);
                self.emit(EngineEvent::PositionChanged(position));
            }
            Err(err) => {
                error!(symbol = %trade.symbol, error = %err, "failed to apply confirmed trade");
            }
        }
    }

    async fn enqueue_mutation<T: Serialize>(
        &self,
        kind: MutationKind,
        entity: &str,
        payload: &T,
    ) -> Result<Uuid, SyncError> {
        let payload = serde_json::to_value(payload)
            .map_err(|err| SyncError::InternalInvariant(format!("unserializable payload: {err}")))?;
        let id = self.queue.lock().await.enqueue(kind, entity, payload);
        self.emit(EngineEvent::MutationEnqueued { id });

        if self.connection_state().is_connected() {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.drain().await;
            });
        }
        Ok(id)
    }

    /// Reject a sell that would exceed the held quantity, counting sells
    /// already queued ahead of it
    async fn check_sell_quantity(&self, symbol: &Symbol, quantity: u64) -> Result<(), SyncError> {
        let held = self.ledger.read().await.held_quantity(symbol);
        let queued: u64 = self
            .queue
            .lock()
            .await
            .pending()
            .iter()
            .filter(|r| r.entity == ENTITY_TRADE)
            .filter_map(|r| serde_json::from_value::<TradeRequest>(r.payload.clone()).ok())
            .filter(|t| t.side == Side::Sell && &t.symbol == symbol)
            .map(|t| t.quantity)
            .sum();

        if quantity + queued > held {
            return Err(SyncError::Validation(format!(
                "cannot sell {} units of {}: {} held, {} already queued to sell",
                quantity, symbol, held, queued
            )));
        }
        Ok(())
    }

    async fn persist_positions(&self) {
        let positions = self.ledger.read().await.positions();
        if let Err(err) = self.sync_store.save(POSITIONS_NAMESPACE, &positions) {
            warn!(error = %err, "failed to persist positions snapshot");
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine; observers are optional
        let _ = self.events.send(event);
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    record: &MutationRecord,
) -> Result<T, SyncError> {
    serde_json::from_value(record.payload.clone()).map_err(|err| {
        SyncError::Validation(format!("malformed {} payload: {err}", record.entity))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MutationStatus;
    use rust_decimal_macros::dec;

    fn engine() -> SyncEngine {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data"));
        SyncEngine::new(EngineConfig::default(), &paths, "token-1", "user-1").unwrap()
    }

    #[tokio::test]
    async fn mutations_enqueue_while_disconnected() {
        let engine = engine();
        let mut events = engine.events();

        let id = engine
            .place_trade(Symbol::player("kohli"), Side::Buy, 10, dec!(100))
            .await
            .unwrap();

        let pending = engine.pending_mutations().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, MutationStatus::Pending);

        match events.recv().await.unwrap() {
            EngineEvent::MutationEnqueued { id: emitted } => assert_eq!(emitted, id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn drain_is_a_no_op_while_disconnected() {
        let engine = engine();
        engine
            .place_trade(Symbol::player("kohli"), Side::Buy, 10, dec!(100))
            .await
            .unwrap();

        engine.drain().await;
        assert_eq!(engine.pending_mutations().await.len(), 1);
    }

    #[tokio::test]
    async fn sell_exceeding_held_quantity_is_rejected_upstream() {
        let engine = engine();
        let result = engine
            .place_trade(Symbol::player("kohli"), Side::Sell, 1, dec!(100))
            .await;
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn queued_sells_count_against_held_quantity() {
        let engine = engine();
        // seed a holding directly through the ledger
        engine
            .ledger
            .write()
            .await
            .apply(&Trade {
                symbol: Symbol::player("kohli"),
                side: Side::Buy,
                quantity: 10,
                price: dec!(100),
                fee: Decimal::ZERO,
                confirmed_at: Utc::now(),
                source_mutation_id: None,
                trade_id: Some("seed".into()),
            })
            .unwrap();

        engine
            .place_trade(Symbol::player("kohli"), Side::Sell, 6, dec!(100))
            .await
            .unwrap();
        let second = engine
            .place_trade(Symbol::player("kohli"), Side::Sell, 6, dec!(100))
            .await;
        assert!(matches!(second, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn zero_quantity_and_amount_are_rejected() {
        let engine = engine();
        assert!(matches!(
            engine
                .place_trade(Symbol::player("p"), Side::Buy, 0, dec!(1))
                .await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            engine.deposit(dec!(0)).await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            engine.withdraw(dec!(-5)).await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn exhausted_reconnects_surface_as_failed_state() {
        // bind then drop to get a port that refuses connections
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path().join("data"));
        let mut config = EngineConfig::default();
        config.ws_url = format!("ws://127.0.0.1:{port}");
        config.reconnect.base_interval_ms = 10;
        config.reconnect.max_interval_ms = 20;
        config.reconnect.max_attempts = 1;
        let engine = SyncEngine::new(config, &paths, "token-1", "user-1").unwrap();
        engine.start().await;

        let mut events = engine.events();
        engine.connect().unwrap();

        // observers can tell exhaustion apart from a requested disconnect
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let EngineEvent::ConnectionChanged(state) = events.recv().await.unwrap() {
                    if state == ConnectionState::Failed {
                        break;
                    }
                    assert_ne!(state, ConnectionState::Disconnected);
                }
            }
        })
        .await
        .expect("engine never reported connection failure");
    }

    #[tokio::test]
    async fn cancel_mutation_only_while_pending() {
        let engine = engine();
        let id = engine.deposit(dec!(500)).await.unwrap();
        assert!(engine.cancel_mutation(id).await);
        assert!(!engine.cancel_mutation(id).await);
    }
}
