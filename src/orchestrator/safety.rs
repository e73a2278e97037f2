// =============================================================================
// Safety Monitor — stop verification loop + one-shot startup recovery
// =============================================================================
//
// The loop guarantees that every filled position carries an exchange-side
// stop: a position found naked gets its stored hard SL re-issued, or an
// emergency safety SL when none was recorded. Unverified placements are
// retried on the next tick, forever.
//
// Recovery runs once at startup, before the steady loops: persisted trade
// snapshots are reconciled against the exchange, fills that happened during
// downtime are replayed, and untracked exchange positions are reported as
// orphans (log-only; adoption is an operator decision).
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::{interval, sleep, Duration};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::bybit::models::OrderState;
use crate::trade::{Trade, TradeStatus};
use crate::types::Side;

use super::monitor::apply_sl_ladder;
use super::orders::{self, TpFamily};
use super::{finalize_close, persist_trade_by_id, stops};

const SAFETY_CHECK_INTERVAL_SECS: u64 = 30;

// =============================================================================
// Steady-state loop
// =============================================================================

pub async fn run_safety_monitor(state: Arc<AppState>) {
    info!(
        interval_secs = SAFETY_CHECK_INTERVAL_SECS,
        "safety monitor started"
    );

    let mut ticker = interval(Duration::from_secs(SAFETY_CHECK_INTERVAL_SECS));
    loop {
        ticker.tick().await;

        for trade in state.trades.active_trades() {
            if matches!(trade.status, TradeStatus::Pending | TradeStatus::Closed) {
                continue;
            }
            verify_stop(&state, &trade).await;
            sleep(Duration::from_millis(300)).await;
        }
    }
}

/// Re-arm the stop on a position that has none.
async fn verify_stop(state: &Arc<AppState>, trade: &Trade) {
    let pos = match state.exchange.position(&trade.symbol, Some(trade.side)).await {
        Ok(Some(pos)) => pos,
        // Position gone: the price monitor owns that transition.
        Ok(None) => return,
        Err(e) => {
            warn!(trade_id = %trade.trade_id, error = %e, "safety position check failed");
            return;
        }
    };

    if pos.stop_loss > 0.0 || pos.trailing_stop > 0.0 {
        return;
    }

    warn!(
        trade_id = %trade.trade_id,
        symbol = %trade.symbol,
        side = %trade.side,
        qty = pos.qty,
        "SAFETY: position has no stop, re-arming"
    );

    if trade.hard_sl_price > 0.0 {
        orders::set_stop(
            state,
            trade,
            Some(trade.hard_sl_price),
            None,
            None,
            "safety re-arm (stored SL)",
        )
        .await;
    } else {
        // Nothing recorded: fall back to the wide safety SL off the average.
        let sl = stops::protective_stop(trade.avg_price, state.config.safety_sl_pct, trade.side);
        orders::set_stop(state, trade, Some(sl), None, None, "safety re-arm (fallback SL)").await;
        let _ = state.trades.update(&trade.trade_id, |t| t.hard_sl_price = sl);
    }
    persist_trade_by_id(state, &trade.trade_id).await;
}

// =============================================================================
// Startup recovery
// =============================================================================

/// Load persisted snapshots and reconcile each against the exchange. Runs to
/// completion before the steady loops start.
pub async fn recover(state: &Arc<AppState>) {
    let snapshots = state.store.load_active_trades().await;
    for trade in snapshots {
        if trade.status == TradeStatus::Closed {
            state.store.delete_active_trade(&trade.trade_id).await;
            continue;
        }
        state.trades.insert_recovered(trade);
    }

    let recovered = state.trades.active_count();
    if recovered > 0 {
        info!(count = recovered, "reconciling recovered trades with exchange");
    }

    for trade in state.trades.active_trades() {
        reconcile_recovered(state, &trade).await;
        sleep(Duration::from_millis(300)).await;
    }

    report_orphans(state).await;

    info!(
        active = state.trades.active_count(),
        "recovery complete"
    );
}

async fn reconcile_recovered(state: &Arc<AppState>, trade: &Trade) {
    let trade_id = &trade.trade_id;

    // A pending entry never held a position; the price monitor resumes the
    // E1 fill/timeout check as normal.
    if trade.status == TradeStatus::Pending {
        info!(trade_id, "recovered pending entry, monitor resumes it");
        return;
    }

    let pos = match state.exchange.position(&trade.symbol, Some(trade.side)).await {
        Ok(pos) => pos,
        Err(e) => {
            error!(trade_id, error = %e, "recovery position check failed, will retry via safety loop");
            return;
        }
    };

    let Some(pos) = pos else {
        // Closed while we were down (stop fired or manual). Synthesize the
        // close from the mark price; the sync loop later corrects the books
        // from the exchange ledger if needed.
        let price = state
            .exchange
            .mark_price(&trade.symbol)
            .await
            .unwrap_or(trade.avg_price);
        let remaining = trade.remaining_qty();
        let mut pnl = trade.realized_pnl;
        if remaining > 0.0 {
            pnl += trade.side.sign() * (price - trade.avg_price) * remaining;
        }
        info!(trade_id, pnl, "position closed during downtime");
        let _ = finalize_close(state, trade_id, price, pnl, "Closed during downtime").await;
        return;
    };

    // The exchange is the source of truth for size and average. Position
    // size is what remains after TP closes, so rebuild total from it.
    let _ = state.trades.update(trade_id, |t| {
        t.total_qty = pos.qty + t.total_tp_closed_qty;
        if pos.avg_price > 0.0 {
            t.avg_price = pos.avg_price;
        }
    });

    replay_downtime_tp_fills(state, trade_id).await;
    replay_downtime_dca_fills(state, trade_id).await;

    // Reinstall the stop if the exchange lost it.
    if pos.stop_loss == 0.0 && pos.trailing_stop == 0.0 {
        if let Some(t) = state.trades.get(trade_id) {
            if t.hard_sl_price > 0.0 {
                orders::set_stop(
                    state,
                    &t,
                    Some(t.hard_sl_price),
                    None,
                    None,
                    "recovery SL reinstall",
                )
                .await;
            }
        }
    }

    persist_trade_by_id(state, trade_id).await;

    if let Some(t) = state.trades.get(trade_id) {
        info!(
            trade_id,
            status = %t.status,
            qty = pos.qty,
            avg = t.avg_price,
            sl = t.hard_sl_price,
            tps = t.tps_hit,
            "trade reconciled"
        );
    }
}

/// Replay TP legs that filled while the bot was down, then re-apply the SL
/// ladder for the highest filled leg. Scale-in is never initiated from a
/// replay.
async fn replay_downtime_tp_fills(state: &Arc<AppState>, trade_id: &str) {
    let Some(trade) = state.trades.get(trade_id) else { return };

    let mut highest: Option<(usize, f64)> = None;
    for idx in 0..trade.tp_prices.len() {
        if trade.tp_filled.get(idx).copied().unwrap_or(true)
            || trade.tp_order_ids[idx].is_empty()
        {
            continue;
        }
        match state
            .exchange
            .order_status(&trade.symbol, &trade.tp_order_ids[idx])
            .await
        {
            Ok(Some(status)) if status.state == OrderState::Filled => {
                let qty = trade
                    .tp_close_qtys
                    .get(idx)
                    .copied()
                    .filter(|q| *q > 0.0)
                    .unwrap_or(status.filled_qty);
                let price = if status.avg_fill_price > 0.0 {
                    status.avg_fill_price
                } else {
                    trade.tp_prices[idx]
                };
                let _ = state.trades.record_tp_fill(trade_id, idx, qty, price);
                highest = Some((idx, price));
                info!(trade_id, leg = idx + 1, price, "TP filled during downtime");
            }
            Ok(_) => {}
            Err(e) => warn!(trade_id, leg = idx + 1, error = %e, "downtime TP check failed"),
        }
    }

    if let Some((idx, price)) = highest {
        if idx == 1 {
            warn!(
                trade_id,
                "TP2 filled during downtime, scale-in skipped (market may have moved)"
            );
        }
        apply_sl_ladder(state, trade_id, idx, price, false).await;
    }
}

/// Replay DCA levels that filled while the bot was down, swapping the TP set
/// exactly as the live path would.
async fn replay_downtime_dca_fills(state: &Arc<AppState>, trade_id: &str) {
    let Some(trade) = state.trades.get(trade_id) else { return };

    for level in 1..trade.dca_levels.len() {
        let dca = &trade.dca_levels[level];
        if dca.filled || dca.order_id.is_empty() {
            continue;
        }
        match state.exchange.order_status(&trade.symbol, &dca.order_id).await {
            Ok(Some(status)) if status.state == OrderState::Filled => {
                let price = if status.avg_fill_price > 0.0 {
                    status.avg_fill_price
                } else {
                    dca.price
                };
                info!(trade_id, level, price, "DCA filled during downtime");
                let _ = state.trades.fill_dca(trade_id, level, price);

                if let Some(mut t) = state.trades.get(trade_id) {
                    orders::cancel_unfilled_tps(state, &mut t).await;
                    state.trades.replace(t);
                }
                let _ = state.trades.setup_dca_tps(trade_id);
                if let Ok(info) = state.exchange.instrument(&trade.symbol).await {
                    let _ = state
                        .trades
                        .consolidate_tps(trade_id, info.min_qty, info.qty_step);
                }
                if let Some(mut t) = state.trades.get(trade_id) {
                    if !t.tp_prices.is_empty() {
                        orders::place_tps(state, &mut t, TpFamily::DcaBased).await;
                        state.trades.replace(t);
                    }
                }
                if let Some(t) = state.trades.get(trade_id) {
                    orders::set_stop(
                        state,
                        &t,
                        Some(t.hard_sl_price),
                        None,
                        None,
                        "hard SL after downtime DCA fill",
                    )
                    .await;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(trade_id, level, error = %e, "downtime DCA check failed"),
        }
    }
}

/// Positions on the exchange that no tracked trade accounts for. Logged
/// only; never closed automatically.
async fn report_orphans(state: &Arc<AppState>) {
    let positions = match state.exchange.all_positions().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "orphan scan failed");
            return;
        }
    };

    let tracked: HashSet<(String, Side)> = state
        .trades
        .active_trades()
        .iter()
        .map(|t| (t.symbol.clone(), t.side))
        .collect();

    for pos in &positions {
        if !tracked.contains(&(pos.symbol.clone(), pos.side)) {
            warn!(
                symbol = %pos.symbol,
                side = %pos.side,
                qty = pos.qty,
                avg = pos.avg_price,
                sl_set = pos.stop_loss > 0.0,
                upnl = pos.unrealized_pnl,
                "ORPHAN position on exchange, not tracked"
            );
        }
    }

    info!(
        exchange_positions = positions.len(),
        tracked = tracked.len(),
        "orphan scan complete"
    );
}
