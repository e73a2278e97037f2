// =============================================================================
// Order placement helpers — write exchange order ids into trade state
// =============================================================================
//
// Each helper mutates a local Trade copy; the caller commits the copy back to
// the manager (TradeManager::replace) so no lock is held across the exchange
// round-trips.
// =============================================================================

use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::bybit::client::OrderKind;
use crate::bybit::ExchangeError;
use crate::trade::Trade;
use crate::types::{build_link_id, OrderTag};

/// Which TP family an order belongs to; keeps signal TPs, avg-based TPs, and
/// post-scale-in TPs distinguishable in logs and link ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpFamily {
    Signal,
    DcaBased,
    PostScaleIn,
}

impl TpFamily {
    fn tag(&self, leg: usize) -> OrderTag {
        match self {
            Self::Signal => OrderTag::Tp(leg),
            Self::DcaBased => OrderTag::DcaTp(leg),
            Self::PostScaleIn => OrderTag::ScaleTp(leg),
        }
    }
}

/// Place the E1 entry: a limit at the signal price, or a market order.
/// Market entries are considered filled immediately at the signal price;
/// the first reconcile tick corrects the average from the exchange.
pub async fn place_entry(state: &AppState, trade: &mut Trade) -> Result<(), ExchangeError> {
    let cfg = &state.config;
    state
        .exchange
        .setup_symbol(&trade.symbol, trade.leverage)
        .await?;

    let link_id = build_link_id(&trade.trade_id, OrderTag::Entry);
    let (kind, price) = if cfg.e1_limit_order {
        (OrderKind::Limit, Some(trade.signal_entry))
    } else {
        (OrderKind::Market, None)
    };

    let qty = trade.dca_levels[0].qty;
    let order_id = state
        .exchange
        .place_order(
            &trade.symbol,
            trade.side,
            trade.side.open_order_side(),
            kind,
            qty,
            price,
            false,
            &link_id,
        )
        .await?;

    let e1 = &mut trade.dca_levels[0];
    e1.order_id = order_id;
    e1.filled = kind == OrderKind::Market;

    info!(
        trade_id = %trade.trade_id,
        symbol = %trade.symbol,
        kind = ?kind,
        qty,
        price = ?price,
        "E1 placed"
    );
    Ok(())
}

/// Place limit orders for every unfilled averaging level. Individual level
/// failures are logged and skipped; the ladder is best-effort.
pub async fn place_dca_orders(state: &AppState, trade: &mut Trade) {
    for level in 1..=trade.max_dca.min(trade.dca_levels.len().saturating_sub(1)) {
        if trade.dca_levels[level].filled || !trade.dca_levels[level].order_id.is_empty() {
            continue;
        }

        let link_id = build_link_id(&trade.trade_id, OrderTag::Dca(level));
        let (qty, price) = (trade.dca_levels[level].qty, trade.dca_levels[level].price);

        match state
            .exchange
            .place_order(
                &trade.symbol,
                trade.side,
                trade.side.open_order_side(),
                OrderKind::Limit,
                qty,
                Some(price),
                false,
                &link_id,
            )
            .await
        {
            Ok(order_id) => {
                info!(
                    trade_id = %trade.trade_id,
                    level,
                    qty,
                    price,
                    %order_id,
                    "DCA placed"
                );
                trade.dca_levels[level].order_id = order_id;
            }
            Err(ExchangeError::InvalidQty) => {
                warn!(trade_id = %trade.trade_id, level, qty, "DCA qty below minimum, skipped");
            }
            Err(e) => {
                error!(trade_id = %trade.trade_id, level, error = %e, "DCA placement failed");
            }
        }
    }
}

/// Place reduce-only limit orders for every unfilled TP leg.
pub async fn place_tps(state: &AppState, trade: &mut Trade, family: TpFamily) {
    for i in 0..trade.tp_prices.len() {
        if trade.tp_filled.get(i).copied().unwrap_or(true)
            || !trade.tp_order_ids[i].is_empty()
            || trade.tp_close_qtys.get(i).copied().unwrap_or(0.0) <= 0.0
        {
            continue;
        }

        let link_id = build_link_id(&trade.trade_id, family.tag(i + 1));
        match state
            .exchange
            .place_order(
                &trade.symbol,
                trade.side,
                trade.side.close_order_side(),
                OrderKind::Limit,
                trade.tp_close_qtys[i],
                Some(trade.tp_prices[i]),
                true,
                &link_id,
            )
            .await
        {
            Ok(order_id) => {
                trade.tp_order_ids[i] = order_id;
            }
            Err(ExchangeError::InvalidQty) => {
                warn!(
                    trade_id = %trade.trade_id,
                    leg = i + 1,
                    qty = trade.tp_close_qtys[i],
                    "TP qty below minimum, leg left to trail"
                );
            }
            Err(e) => {
                warn!(trade_id = %trade.trade_id, leg = i + 1, error = %e, "TP placement failed");
            }
        }
    }

    let placed = trade
        .tp_order_ids
        .iter()
        .zip(&trade.tp_filled)
        .filter(|(id, filled)| !id.is_empty() && !**filled)
        .count();
    info!(
        trade_id = %trade.trade_id,
        family = ?family,
        placed,
        total = trade.tp_prices.len(),
        prices = ?trade.tp_prices,
        "TP legs placed"
    );
}

/// Set an exchange-side stop; returns whether the exchange verified it. An
/// unverified stop is logged at error severity and left for the safety loop.
pub async fn set_stop(
    state: &AppState,
    trade: &Trade,
    stop_loss: Option<f64>,
    trailing_stop: Option<f64>,
    active_price: Option<f64>,
    label: &str,
) -> bool {
    match state
        .exchange
        .set_trading_stop(&trade.symbol, trade.side, stop_loss, trailing_stop, active_price)
        .await
    {
        Ok(true) => {
            info!(
                trade_id = %trade.trade_id,
                ?stop_loss,
                ?trailing_stop,
                label,
                "stop set"
            );
            true
        }
        Ok(false) => {
            error!(
                trade_id = %trade.trade_id,
                ?stop_loss,
                label,
                "CRITICAL: stop NOT verified, safety loop will retry"
            );
            false
        }
        Err(e) => {
            error!(
                trade_id = %trade.trade_id,
                ?stop_loss,
                label,
                error = %e,
                "CRITICAL: stop placement failed, safety loop will retry"
            );
            false
        }
    }
}

/// Cancel every unfilled TP order and clear the ids.
pub async fn cancel_unfilled_tps(state: &AppState, trade: &mut Trade) {
    for i in 0..trade.tp_order_ids.len() {
        if trade.tp_filled.get(i).copied().unwrap_or(true) || trade.tp_order_ids[i].is_empty() {
            continue;
        }
        if let Err(e) = state
            .exchange
            .cancel(&trade.symbol, &trade.tp_order_ids[i])
            .await
        {
            warn!(trade_id = %trade.trade_id, leg = i + 1, error = %e, "TP cancel failed");
        }
        trade.tp_order_ids[i].clear();
    }
}

/// Cancel every unfilled DCA order and clear the ids.
pub async fn cancel_unfilled_dcas(state: &AppState, trade: &mut Trade) {
    for level in 1..trade.dca_levels.len() {
        if trade.dca_levels[level].filled || trade.dca_levels[level].order_id.is_empty() {
            continue;
        }
        if let Err(e) = state
            .exchange
            .cancel(&trade.symbol, &trade.dca_levels[level].order_id)
            .await
        {
            warn!(trade_id = %trade.trade_id, level, error = %e, "DCA cancel failed");
        }
        trade.dca_levels[level].order_id.clear();
    }
}

/// Place the scale-in limit at the TP2 fill price, sized like the E1 slot.
/// Returns whether the order went up.
pub async fn place_scale_in(state: &AppState, trade: &mut Trade, limit_price: f64) -> bool {
    let margin = trade.dca_levels[0].margin;
    let qty = margin * trade.leverage as f64 / limit_price;
    let link_id = build_link_id(&trade.trade_id, OrderTag::ScaleIn);

    match state
        .exchange
        .place_order(
            &trade.symbol,
            trade.side,
            trade.side.open_order_side(),
            OrderKind::Limit,
            qty,
            Some(limit_price),
            false,
            &link_id,
        )
        .await
    {
        Ok(order_id) => {
            trade.scale_in_pending = true;
            trade.scale_in_order_id = order_id;
            trade.scale_in_margin = margin;
            trade.scale_in_qty = qty;
            info!(
                trade_id = %trade.trade_id,
                qty,
                limit_price,
                margin,
                "scale-in limit placed, SL stays at break-even until fill"
            );
            true
        }
        Err(e) => {
            error!(trade_id = %trade.trade_id, error = %e, "scale-in placement failed");
            false
        }
    }
}

/// Sweep a symbol: cancel everything, then market-close whatever remains of
/// the position with a reduce-only order. Returns whether a close order was
/// submitted.
pub async fn close_position_market(state: &AppState, trade: &Trade, reason: &str) -> bool {
    if let Err(e) = state.exchange.cancel_all(&trade.symbol).await {
        warn!(symbol = %trade.symbol, error = %e, "cancel-all failed during close");
    }

    let remaining = if trade.remaining_qty() > 0.0 {
        trade.remaining_qty()
    } else {
        trade.total_qty
    };
    if remaining <= 0.0 {
        warn!(
            trade_id = %trade.trade_id,
            reason,
            "close skipped: no filled quantity"
        );
        return false;
    }

    let link_id = build_link_id(&trade.trade_id, OrderTag::Close);
    match state
        .exchange
        .place_order(
            &trade.symbol,
            trade.side,
            trade.side.close_order_side(),
            OrderKind::Market,
            remaining,
            None,
            true,
            &link_id,
        )
        .await
    {
        Ok(order_id) => {
            info!(trade_id = %trade.trade_id, remaining, %order_id, reason, "position closed at market");
            true
        }
        Err(e) => {
            error!(trade_id = %trade.trade_id, error = %e, reason, "market close failed");
            false
        }
    }
}
