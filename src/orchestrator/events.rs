// =============================================================================
// Channel/command event handlers — close, TP-hit, trend switch
// =============================================================================
//
// Shared by the messaging-channel listener and the HTTP surface; both funnel
// into the same handlers so an operator command and a channel message behave
// identically.
// =============================================================================

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::app_state::AppState;
use crate::trade::{Trade, TradeStatus};
use crate::types::TrendDirection;

use super::{finalize_close, orders};

/// Close the active trade on `symbol` (exchange form or display form) with a
/// reduce-only market order. Returns a summary, or `None` when no trade
/// matches.
pub async fn handle_close_command(
    state: &Arc<AppState>,
    symbol: &str,
    reason: &str,
) -> Option<Value> {
    let trade = state.trades.find_by_symbol(symbol)?;

    let price = state
        .exchange
        .mark_price(&trade.symbol)
        .await
        .unwrap_or(trade.avg_price);

    let submitted = orders::close_position_market(state, &trade, reason).await;

    let pnl = estimated_close_pnl(&trade, price);
    let closed = finalize_close(state, &trade.trade_id, price, pnl, reason).await?;

    info!(
        symbol = %closed.symbol_display,
        pnl,
        submitted,
        reason,
        "close command executed"
    );

    Some(json!({
        "status": "closed",
        "trade_id": closed.trade_id,
        "symbol": closed.symbol_display,
        "pnl": pnl,
    }))
}

/// The channel reported a target done for a symbol whose entry never filled:
/// the move happened without us, so waiting for a pullback is pointless.
/// Cancels only PENDING trades.
pub async fn handle_tp_hit(state: &Arc<AppState>, symbol: &str, tp_number: usize) {
    let Some(trade) = state.trades.find_by_symbol(symbol) else {
        return;
    };

    if trade.status != TradeStatus::Pending {
        info!(
            symbol = %trade.symbol_display,
            status = %trade.status,
            tp_number,
            "TP-hit notice for a filled trade, keeping it"
        );
        return;
    }

    let order_id = trade.dca_levels[0].order_id.clone();
    if !order_id.is_empty() {
        let _ = state.exchange.cancel(&trade.symbol, &order_id).await;
    }
    let _ = finalize_close(
        state,
        &trade.trade_id,
        0.0,
        0.0,
        "TP already hit (unfilled)",
    )
    .await;
    info!(
        symbol = %trade.symbol_display,
        tp_number,
        "pending entry cancelled, target already done"
    );
}

/// Persist the new trend marker and close every active trade on the
/// opposing side of that symbol. Pending entries are cancelled; filled
/// positions are market-closed.
pub async fn handle_trend_switch(
    state: &Arc<AppState>,
    symbol: &str,
    direction: TrendDirection,
) -> Vec<Value> {
    state.store.set_trend(symbol, direction).await;

    let close_side = direction.opposing_side();
    info!(
        symbol,
        %direction,
        closing = %close_side,
        "trend switch: marker stored, sweeping opposing positions"
    );

    let mut closed = Vec::new();
    for trade in state.trades.active_trades() {
        if trade.symbol != symbol || trade.side != close_side {
            continue;
        }

        let reason = format!("Trend switch ({direction})");

        if trade.status == TradeStatus::Pending || trade.total_qty <= 0.0 {
            let _ = state.exchange.cancel_all(&trade.symbol).await;
            let _ = finalize_close(state, &trade.trade_id, 0.0, 0.0, &reason).await;
            closed.push(json!({
                "trade_id": trade.trade_id,
                "symbol": trade.symbol_display,
                "side": trade.side,
                "pnl": 0.0,
                "unfilled": true,
            }));
            continue;
        }

        let price = state
            .exchange
            .mark_price(&trade.symbol)
            .await
            .unwrap_or(trade.avg_price);
        orders::close_position_market(state, &trade, &reason).await;

        let pnl = estimated_close_pnl(&trade, price);
        let _ = finalize_close(state, &trade.trade_id, price, pnl, &reason).await;
        closed.push(json!({
            "trade_id": trade.trade_id,
            "symbol": trade.symbol_display,
            "side": trade.side,
            "pnl": pnl,
        }));
    }

    if closed.is_empty() {
        info!(symbol, side = %close_side, "trend switch: nothing to close");
    }
    closed
}

/// Mark-price estimate for a commanded close: realized legs plus the
/// remainder marked at `price`. The sync loop later reconciles against the
/// exchange ledger if the estimate drifts.
fn estimated_close_pnl(trade: &Trade, price: f64) -> f64 {
    let remaining = trade.remaining_qty();
    let mut pnl = trade.realized_pnl;
    if remaining > 0.0 && price > 0.0 {
        pnl += trade.side.sign() * (price - trade.avg_price) * remaining;
    }
    pnl
}
