// =============================================================================
// Price Monitor — the primary reconcile loop (~2 s tick)
// =============================================================================
//
// Per trade, in priority order each tick:
//   0. PENDING: entry fill / timeout, then the batch fill cap
//   0b. scale-in limit fill
//   1. TP fills -> SL ladder (one leg per tick)
//   2. DCA fills -> swap to avg-based TPs + hard SL (one level per tick)
//   2b. quick-trail tightening after a DCA bounce
//   3. position vanished -> authoritative close from the exchange ledger
//
// All exits are exchange-side; this loop only observes fills and keeps the
// resting stop orders consistent with the ladder. Errors never escape a
// tick: transient exchange failures make the step a no-op until next tick.
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::bybit::models::OrderState;
use crate::trade::{Trade, TradeStatus};
use crate::types::unix_now;

use super::orders::{self, TpFamily};
use super::{finalize_close, persist_trade_by_id, stops};

/// Tick period of the monitor loop.
const MONITOR_INTERVAL_SECS: u64 = 2;
/// Pause between trades within one tick; keeps the request rate civil.
const INTER_TRADE_DELAY_MS: u64 = 200;

pub async fn run_price_monitor(state: Arc<AppState>) {
    info!(interval_secs = MONITOR_INTERVAL_SECS, "price monitor started");

    let mut ticker = interval(Duration::from_secs(MONITOR_INTERVAL_SECS));
    loop {
        ticker.tick().await;

        let active = state.trades.active_trades();
        if active.is_empty() {
            continue;
        }

        for trade in active {
            monitor_trade(&state, trade).await;
            sleep(Duration::from_millis(INTER_TRADE_DELAY_MS)).await;
        }
    }
}

/// One reconcile pass over a single trade. Works from snapshots and
/// re-reads between stages so a close in an earlier stage stops the rest.
async fn monitor_trade(state: &Arc<AppState>, trade: Trade) {
    let trade_id = trade.trade_id.clone();

    if trade.status == TradeStatus::Pending {
        handle_pending(state, &trade).await;
        return;
    }

    if trade.scale_in_pending && !trade.scale_in_order_id.is_empty() {
        check_scale_in_fill(state, &trade).await;
    }

    if let Some(t) = fresh(state, &trade_id) {
        check_tp_fills(state, &t).await;
    }
    if let Some(t) = fresh(state, &trade_id) {
        check_dca_fills(state, &t).await;
    }
    if let Some(t) = fresh(state, &trade_id) {
        check_quick_trail(state, &t).await;
    }
    if let Some(t) = fresh(state, &trade_id) {
        check_position_vanished(state, &t).await;
    }
}

fn fresh(state: &AppState, trade_id: &str) -> Option<Trade> {
    state.trades.get(trade_id).filter(|t| t.is_active())
}

// =============================================================================
// 0. PENDING entries
// =============================================================================

async fn handle_pending(state: &Arc<AppState>, trade: &Trade) {
    let order_id = trade.dca_levels[0].order_id.clone();
    if order_id.is_empty() {
        // Entry never made it to the exchange; free the slot.
        let _ = finalize_close(state, &trade.trade_id, 0.0, 0.0, "E1 order missing").await;
        return;
    }

    let status = match state.exchange.order_status(&trade.symbol, &order_id).await {
        Ok(s) => s,
        Err(e) if e.is_transient() => {
            // Rate limit or transport hiccup: this tick is a no-op.
            debug!(trade_id = %trade.trade_id, error = %e, "entry status check deferred");
            return;
        }
        Err(e) => {
            warn!(trade_id = %trade.trade_id, error = %e, "entry status check failed");
            return;
        }
    };

    match status.map(|s| (s.state, s)) {
        Some((OrderState::Filled, s)) => {
            on_entry_filled(state, trade, s.avg_fill_price, s.filled_qty).await;
        }
        Some((OrderState::Cancelled, _)) | Some((OrderState::Rejected, _)) => {
            info!(trade_id = %trade.trade_id, "entry cancelled on exchange");
            let _ = finalize_close(state, &trade.trade_id, 0.0, 0.0, "E1 cancelled on exchange").await;
        }
        _ => {
            // Still resting (or not yet visible): enforce the entry timeout.
            let age_min = trade.age_secs(unix_now()) / 60.0;
            if age_min >= state.config.e1_timeout_minutes {
                if let Err(e) = state.exchange.cancel(&trade.symbol, &order_id).await {
                    warn!(trade_id = %trade.trade_id, error = %e, "entry cancel failed");
                }
                let reason = format!("E1 timeout ({}min)", state.config.e1_timeout_minutes);
                let _ = finalize_close(state, &trade.trade_id, 0.0, 0.0, &reason).await;
            }
        }
    }
}

/// E1 filled: place the DCA ladder and the signal-target TPs, arm the wide
/// safety SL, then enforce the per-batch fill cap.
async fn on_entry_filled(state: &Arc<AppState>, trade: &Trade, fill_price: f64, filled_qty: f64) {
    let trade_id = &trade.trade_id;
    let price = if fill_price > 0.0 {
        fill_price
    } else {
        trade.signal_entry
    };
    let _ = state.trades.fill_entry(trade_id, price, filled_qty);

    let Some(mut t) = state.trades.get(trade_id) else { return };
    orders::place_dca_orders(state, &mut t).await;
    state.trades.replace(t);

    let _ = state.trades.setup_tp_qtys(trade_id);
    match state.exchange.instrument(&trade.symbol).await {
        Ok(info) => {
            let _ = state
                .trades
                .consolidate_tps(trade_id, info.min_qty, info.qty_step);
        }
        Err(e) => warn!(trade_id, error = %e, "instrument lookup failed, TPs unconsolidated"),
    }

    if let Some(mut t) = state.trades.get(trade_id) {
        if !t.tp_prices.is_empty() {
            orders::place_tps(state, &mut t, TpFamily::Signal).await;
            state.trades.replace(t);
        }
    }

    // Wide safety SL that leaves the DCA levels room to fill.
    if let Some(t) = state.trades.get(trade_id) {
        let sl = stops::protective_stop(t.avg_price, state.config.safety_sl_pct, t.side);
        orders::set_stop(state, &t, Some(sl), None, None, "safety SL").await;
        let _ = state.trades.update(trade_id, |t| t.hard_sl_price = sl);
    }

    persist_trade_by_id(state, trade_id).await;
    info!(trade_id, price, "E1 filled, trade OPEN");

    if let Some(batch_id) = trade.batch_id.clone() {
        enforce_batch_cap(state, &batch_id).await;
    }
}

/// Once a batch reaches `max_fills_per_batch` filled entries, every sibling
/// still PENDING is cancelled and closed.
async fn enforce_batch_cap(state: &Arc<AppState>, batch_id: &str) {
    let cap = state.config.max_fills_per_batch;
    if cap == 0 {
        return;
    }

    let trades = state.trades.active_trades();
    let fills = stops::batch_fill_count(&trades, batch_id);
    if fills < cap {
        return;
    }

    let pending: Vec<Trade> = stops::pending_batch_siblings(&trades, batch_id)
        .into_iter()
        .cloned()
        .collect();
    if pending.is_empty() {
        return;
    }

    info!(
        batch_id,
        fills,
        cap,
        cancelled = pending.len(),
        "batch cap reached, sweeping pending siblings"
    );

    let reason = format!("Batch cap ({cap} fills reached)");
    for sibling in pending {
        let order_id = sibling.dca_levels[0].order_id.clone();
        if !order_id.is_empty() {
            if let Err(e) = state.exchange.cancel(&sibling.symbol, &order_id).await {
                warn!(trade_id = %sibling.trade_id, error = %e, "batch-cap cancel failed");
            }
        }
        let _ = finalize_close(state, &sibling.trade_id, 0.0, 0.0, &reason).await;
    }
}

// =============================================================================
// 0b. Scale-in fill
// =============================================================================

async fn check_scale_in_fill(state: &Arc<AppState>, trade: &Trade) {
    let status = match state
        .exchange
        .order_status(&trade.symbol, &trade.scale_in_order_id)
        .await
    {
        Ok(Some(s)) => s,
        Ok(None) => return,
        Err(e) => {
            debug!(trade_id = %trade.trade_id, error = %e, "scale-in status check failed");
            return;
        }
    };

    if status.state != OrderState::Filled {
        return;
    }

    let _ = state.trades.update(&trade.trade_id, |t| {
        if status.avg_fill_price > 0.0 {
            t.scale_in_price = status.avg_fill_price;
        }
    });
    complete_scale_in(state, &trade.trade_id).await;
}

/// Scale-in completion: adopt the exchange's position as truth, re-spread
/// the unfilled TP legs over the enlarged remainder, and pin the SL to the
/// exact new average (zero risk on the pyramided portion).
async fn complete_scale_in(state: &Arc<AppState>, trade_id: &str) {
    let Some(t) = state.trades.get(trade_id) else { return };

    let pos = match state.exchange.position(&t.symbol, Some(t.side)).await {
        Ok(Some(p)) => p,
        Ok(None) => {
            error!(trade_id, "scale-in filled but position missing");
            return;
        }
        Err(e) => {
            warn!(trade_id, error = %e, "position read failed after scale-in");
            return;
        }
    };

    let mut added = pos.qty - t.remaining_qty();
    if added <= 0.0 {
        added = t.scale_in_qty;
    }
    let fill_price = if t.scale_in_price > 0.0 {
        t.scale_in_price
    } else {
        pos.avg_price
    };

    let _ = state
        .trades
        .fill_scale_in(trade_id, fill_price, added, t.scale_in_margin);
    if pos.avg_price > 0.0 {
        let _ = state.trades.update(trade_id, |t| t.avg_price = pos.avg_price);
    }

    if let Some(mut t) = state.trades.get(trade_id) {
        orders::cancel_unfilled_tps(state, &mut t).await;
        state.trades.replace(t);
    }

    let _ = state.trades.recalc_tps_after_scale_in(trade_id);
    if let Ok(info) = state.exchange.instrument(&pos.symbol).await {
        let _ = state
            .trades
            .consolidate_tps(trade_id, info.min_qty, info.qty_step);
    }
    if let Some(mut t) = state.trades.get(trade_id) {
        if !t.tp_prices.is_empty() {
            orders::place_tps(state, &mut t, TpFamily::PostScaleIn).await;
            state.trades.replace(t);
        }
    }

    if let Some(t) = state.trades.get(trade_id) {
        let sl = t.avg_price;
        orders::set_stop(state, &t, Some(sl), None, None, "scale-in SL to exact avg").await;
        let _ = state.trades.update(trade_id, |t| t.hard_sl_price = sl);
    }

    persist_trade_by_id(state, trade_id).await;
    info!(trade_id, added, fill_price, "scale-in complete");
}

// =============================================================================
// 1. TP fills + SL ladder
// =============================================================================

async fn check_tp_fills(state: &Arc<AppState>, trade: &Trade) {
    if !matches!(trade.status, TradeStatus::Open | TradeStatus::DcaActive) {
        return;
    }

    for idx in 0..trade.tp_prices.len() {
        if trade.tp_filled.get(idx).copied().unwrap_or(true)
            || trade
                .tp_order_ids
                .get(idx)
                .map(|id| id.is_empty())
                .unwrap_or(true)
        {
            continue;
        }

        let status = match state
            .exchange
            .order_status(&trade.symbol, &trade.tp_order_ids[idx])
            .await
        {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                debug!(trade_id = %trade.trade_id, leg = idx + 1, error = %e, "TP status check failed");
                continue;
            }
        };

        if status.state != OrderState::Filled {
            continue;
        }

        let close_qty = trade
            .tp_close_qtys
            .get(idx)
            .copied()
            .filter(|q| *q > 0.0)
            .unwrap_or(status.filled_qty);
        let fill_price = if status.avg_fill_price > 0.0 {
            status.avg_fill_price
        } else {
            trade.tp_prices[idx]
        };

        let _ = state
            .trades
            .record_tp_fill(&trade.trade_id, idx, close_qty, fill_price);
        apply_sl_ladder(state, &trade.trade_id, idx, fill_price, true).await;
        persist_trade_by_id(state, &trade.trade_id).await;

        // One TP per cycle keeps the ladder transitions ordered.
        break;
    }
}

/// The two SL ladders. E1 mode walks break-even -> scale-in -> profit lock
/// -> trailing; DCA mode walks SL-to-avg -> trailing with a TP1 floor.
/// Recovery replays pass `allow_scale_in = false`: pyramiding into a market
/// that moved during downtime is not worth the risk.
pub(crate) async fn apply_sl_ladder(
    state: &Arc<AppState>,
    trade_id: &str,
    tp_idx: usize,
    fill_price: f64,
    allow_scale_in: bool,
) {
    let cfg = &state.config;
    let Some(t) = state.trades.get(trade_id) else { return };

    if t.current_dca > 0 {
        // ── Avg-based ladder (post-DCA) ─────────────────────────────
        if tp_idx == 0 {
            let be = stops::favorable_offset(t.avg_price, cfg.dca_be_buffer_pct, t.side);
            orders::set_stop(state, &t, Some(be), None, None, "DCA TP1, SL to avg").await;
            let _ = state.trades.update(trade_id, |t| t.hard_sl_price = be);
        }

        if let Some(t) = state.trades.get(trade_id) {
            if t.all_tps_filled() {
                let dist = stops::trailing_distance(fill_price, cfg.dca_trail_callback_pct);
                let floor = t.tp_prices.first().copied();
                orders::set_stop(state, &t, floor, Some(dist), None, "DCA TPs done, trailing").await;
                if let Some(floor) = floor {
                    let _ = state.trades.update(trade_id, |t| t.hard_sl_price = floor);
                }
            }
        }
        return;
    }

    // ── Signal-target ladder (pre-DCA) ──────────────────────────────
    match tp_idx {
        0 if cfg.sl_to_be_after_tp1 => {
            // TP1: SL to break-even plus buffer, and the averaging ladder is
            // no longer wanted.
            let be = stops::breakeven_price(t.signal_entry, cfg.be_buffer_pct, t.side);
            orders::set_stop(state, &t, Some(be), None, None, "TP1, SL to break-even").await;
            let _ = state.trades.update(trade_id, |t| t.hard_sl_price = be);

            if let Some(mut t) = state.trades.get(trade_id) {
                orders::cancel_unfilled_dcas(state, &mut t).await;
                state.trades.replace(t);
            }
        }
        1 => {
            if allow_scale_in
                && cfg.scale_in_enabled
                && t.current_dca == 0
                && !t.scale_in_filled
                && !t.scale_in_pending
            {
                let mut t = t.clone();
                orders::place_scale_in(state, &mut t, fill_price).await;
                state.trades.replace(t);
            } else {
                info!(
                    trade_id,
                    sl = t.hard_sl_price,
                    "TP2 filled, SL stays at break-even"
                );
            }
        }
        2 => {
            // Profit lock: TP2 price if the pyramid is on, else TP1 price.
            let target = if t.scale_in_filled {
                t.tp_prices.get(1).copied()
            } else {
                t.tp_prices.first().copied()
            };
            if let Some(target) = target {
                let label = if t.scale_in_filled {
                    "TP3, SL to TP2"
                } else {
                    "TP3, SL to TP1"
                };
                orders::set_stop(state, &t, Some(target), None, None, label).await;
                let _ = state.trades.update(trade_id, |t| t.hard_sl_price = target);
            }
        }
        _ => {}
    }

    if let Some(t) = state.trades.get(trade_id) {
        if t.all_tps_filled() {
            let dist = stops::trailing_distance(fill_price, cfg.trailing_callback_pct);
            let floor = (t.hard_sl_price > 0.0).then_some(t.hard_sl_price);
            orders::set_stop(state, &t, floor, Some(dist), None, "all TPs done, trailing").await;
        }
    }
}

// =============================================================================
// 2. DCA fills
// =============================================================================

async fn check_dca_fills(state: &Arc<AppState>, trade: &Trade) {
    if !matches!(trade.status, TradeStatus::Open | TradeStatus::DcaActive) {
        return;
    }

    for level in 1..trade.dca_levels.len() {
        let dca = &trade.dca_levels[level];
        if dca.filled || dca.order_id.is_empty() {
            continue;
        }

        let status = match state.exchange.order_status(&trade.symbol, &dca.order_id).await {
            Ok(Some(s)) => s,
            Ok(None) => continue,
            Err(e) => {
                debug!(trade_id = %trade.trade_id, level, error = %e, "DCA status check failed");
                continue;
            }
        };
        if status.state != OrderState::Filled {
            continue;
        }

        let fill_price = if status.avg_fill_price > 0.0 {
            status.avg_fill_price
        } else {
            dca.price
        };
        let _ = state.trades.fill_dca(&trade.trade_id, level, fill_price);

        // Signal TPs are void: swap to avg-based TPs over the full position.
        if let Some(mut t) = state.trades.get(&trade.trade_id) {
            orders::cancel_unfilled_tps(state, &mut t).await;
            state.trades.replace(t);
        }
        let _ = state.trades.setup_dca_tps(&trade.trade_id);
        if let Ok(info) = state.exchange.instrument(&trade.symbol).await {
            let _ = state
                .trades
                .consolidate_tps(&trade.trade_id, info.min_qty, info.qty_step);
        }
        if let Some(mut t) = state.trades.get(&trade.trade_id) {
            if !t.tp_prices.is_empty() {
                orders::place_tps(state, &mut t, TpFamily::DcaBased).await;
                state.trades.replace(t);
            }
        }

        // Hard SL was re-anchored on the deepest fill by fill_dca.
        if let Some(t) = state.trades.get(&trade.trade_id) {
            orders::set_stop(
                state,
                &t,
                Some(t.hard_sl_price),
                None,
                None,
                "hard SL after DCA fill",
            )
            .await;
        }

        persist_trade_by_id(state, &trade.trade_id).await;

        // One DCA per cycle.
        break;
    }
}

// =============================================================================
// 2b. Quick-trail
// =============================================================================

/// One-shot SL tightening: after a DCA, once price recovers by the trigger
/// percentage, pull the stop from the wide hard SL up to just beyond the
/// average.
async fn check_quick_trail(state: &Arc<AppState>, trade: &Trade) {
    let cfg = &state.config;
    if trade.status != TradeStatus::DcaActive
        || trade.current_dca == 0
        || trade.quick_trail_active
        || trade.tps_hit > 0
    {
        return;
    }

    let Some(mark) = state.exchange.mark_price(&trade.symbol).await else {
        return;
    };
    if !stops::quick_trail_triggered(
        trade.side,
        trade.avg_price,
        mark,
        cfg.dca_quick_trail_trigger_pct,
    ) {
        return;
    }

    let new_sl = stops::protective_stop(trade.avg_price, cfg.dca_quick_trail_buffer_pct, trade.side);
    orders::set_stop(state, trade, Some(new_sl), None, None, "quick-trail tighten").await;
    let _ = state.trades.update(&trade.trade_id, |t| {
        t.hard_sl_price = new_sl;
        t.quick_trail_active = true;
    });
    persist_trade_by_id(state, &trade.trade_id).await;
    info!(
        trade_id = %trade.trade_id,
        mark,
        new_sl,
        "quick-trail: SL tightened to average"
    );
}

// =============================================================================
// 3. Position vanished (exchange-side close)
// =============================================================================

async fn check_position_vanished(state: &Arc<AppState>, trade: &Trade) {
    if !matches!(
        trade.status,
        TradeStatus::Open | TradeStatus::DcaActive | TradeStatus::Trailing
    ) {
        return;
    }

    match state.exchange.position(&trade.symbol, Some(trade.side)).await {
        Ok(Some(_)) => {}
        Ok(None) => handle_vanished(state, trade).await,
        Err(e) => {
            debug!(trade_id = %trade.trade_id, error = %e, "position check failed");
        }
    }
}

/// The exchange closed the position (SL, trailing stop, or a manual close).
/// Sweep stragglers, force-close any residual, then record the close with
/// the exchange's own PnL ledger as the authority.
async fn handle_vanished(state: &Arc<AppState>, trade: &Trade) {
    info!(
        trade_id = %trade.trade_id,
        status = %trade.status,
        "position gone from exchange, finalizing"
    );

    if let Err(e) = state.exchange.cancel_all(&trade.symbol).await {
        warn!(symbol = %trade.symbol, error = %e, "cancel-all failed");
    }

    // Cancelling reduce-only orders cannot reopen a position, but verify.
    sleep(Duration::from_millis(500)).await;
    if let Ok(Some(residual)) = state.exchange.position(&trade.symbol, Some(trade.side)).await {
        if residual.qty > 0.0 {
            warn!(
                trade_id = %trade.trade_id,
                qty = residual.qty,
                "residual position after exchange stop, force closing"
            );
            orders::close_position_market(state, trade, "Residual after exchange stop").await;
        }
    }

    // Give the exchange a moment to settle the closed-PnL records.
    sleep(Duration::from_secs(1)).await;

    let price = state
        .exchange
        .mark_price(&trade.symbol)
        .await
        .unwrap_or(trade.avg_price);

    let pnl = match authoritative_pnl(state, trade).await {
        Some(pnl) => {
            info!(trade_id = %trade.trade_id, pnl, "PnL from exchange ledger");
            pnl
        }
        None => {
            // Ledger not settled yet: estimate the remainder from the mark.
            let remaining = trade.remaining_qty();
            let mut pnl = trade.realized_pnl;
            if remaining > 0.0 {
                pnl += trade.side.sign() * (price - trade.avg_price) * remaining;
            }
            warn!(
                trade_id = %trade.trade_id,
                pnl,
                "PnL fallback from mark price (ledger unavailable)"
            );
            pnl
        }
    };

    let reason = stops::vanished_close_reason(trade);
    let _ = finalize_close(state, &trade.trade_id, price, pnl, &reason).await;
}

/// Sum the exchange's closed-PnL records for this trade since it opened.
/// Fees-inclusive; `None` until the ledger shows at least one record.
async fn authoritative_pnl(state: &AppState, trade: &Trade) -> Option<f64> {
    let since_ms = (trade.opened_at * 1000.0) as i64;
    let records = match state.exchange.closed_pnl(since_ms, 50).await {
        Ok(r) => r,
        Err(e) => {
            warn!(trade_id = %trade.trade_id, error = %e, "closed-pnl fetch failed");
            return None;
        }
    };

    let matching: Vec<_> = records
        .iter()
        .filter(|r| r.symbol == trade.symbol && r.side == trade.side)
        .collect();
    if matching.is_empty() {
        return None;
    }

    let total: f64 = matching.iter().map(|r| r.realized_pnl).sum();
    debug!(
        trade_id = %trade.trade_id,
        records = matching.len(),
        total,
        "closed-pnl records aggregated"
    );
    Some(total)
}
