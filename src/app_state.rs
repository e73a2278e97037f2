// =============================================================================
// Central Application State — Helios Trading Engine
// =============================================================================
//
// The single source of truth shared by every loop and the HTTP surface.
// Nothing here is a global: the orchestrator owns an Arc<AppState> and hands
// it to each task. Each subsystem manages its own interior mutability;
// AppState just ties them together.
// =============================================================================

use crate::bybit::BybitClient;
use crate::config::BotConfig;
use crate::orchestrator::admission::SignalBatch;
use crate::store::Store;
use crate::trade_manager::TradeManager;
use crate::types::unix_now;
use crate::zones::ZoneBook;

pub struct AppState {
    /// Immutable after startup.
    pub config: BotConfig,
    /// Exchange client (C2). Stateless apart from mode + instrument caches.
    pub exchange: BybitClient,
    /// Durable store (C1); degrades to no-ops without a database.
    pub store: Store,
    /// The live trade set (C4); sole mutator of Trade fields.
    pub trades: TradeManager,
    /// Zone cache (C3), warmed from the store at startup.
    pub zones: ZoneBook,
    /// Admission buffer with its debounce generation counter.
    pub batch: SignalBatch,
    /// Unix seconds at process start; the sync loop ignores older closes.
    pub started_at: f64,
}

impl AppState {
    pub fn new(config: BotConfig, exchange: BybitClient, store: Store) -> Self {
        let trades = TradeManager::new(config.clone());
        Self {
            config,
            exchange,
            store,
            trades,
            zones: ZoneBook::new(),
            batch: SignalBatch::new(),
            started_at: unix_now(),
        }
    }
}
