// =============================================================================
// Orchestrator — batch admission, order placement, and the four steady loops
// =============================================================================

pub mod admission;
pub mod events;
pub mod monitor;
pub mod orders;
pub mod safety;
pub mod stops;
pub mod sync;
pub mod zone_loop;

use chrono::Utc;
use tracing::info;

use crate::app_state::AppState;
use crate::trade::Trade;

/// Persist the current snapshot of a trade; store failures degrade silently
/// (the store logs them).
pub async fn persist_trade(state: &AppState, trade: &Trade) {
    state.store.save_active_trade(trade).await;
}

/// Persist the freshest tracked state of a trade by id.
pub async fn persist_trade_by_id(state: &AppState, trade_id: &str) {
    if let Some(trade) = state.trades.get(trade_id) {
        state.store.save_active_trade(&trade).await;
    }
}

/// Terminal close bookkeeping: mutate the manager, write the journal entry
/// (idempotent on trade_id), drop the active snapshot, and fold the result
/// into today's equity row. Unfilled trades only clear their snapshot.
pub async fn finalize_close(
    state: &AppState,
    trade_id: &str,
    close_price: f64,
    pnl: f64,
    reason: &str,
) -> Option<Trade> {
    let (trade, record) = state.trades.close_trade(trade_id, close_price, pnl, reason)?;

    state.store.delete_active_trade(trade_id).await;

    if let Some(record) = record {
        state.store.save_closed_trade(&record).await;

        let date = Utc::now().format("%Y-%m-%d").to_string();
        let (wins, losses) = if pnl > 0.01 {
            (1, 0)
        } else if pnl < -0.01 {
            (0, 1)
        } else {
            (0, 0)
        };
        state
            .store
            .record_daily_equity(&date, record.equity_at_close, pnl, wins, losses)
            .await;
    } else {
        info!(trade_id, reason, "unfilled trade closed without journal entry");
    }

    Some(trade)
}
