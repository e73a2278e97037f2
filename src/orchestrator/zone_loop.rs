// =============================================================================
// Zone refresh loop + dynamic DCA re-snapping
// =============================================================================
//
// Every `zone_refresh_minutes`, symbols held by active trades get their
// derived swing zones recomputed from candles, unless a fresh external push
// already covers them. Any zone change (refresh or push) re-snaps resting
// DCA orders; an order is amended only when the new price moves by more
// than the re-snap threshold, so small feed updates do not churn orders.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::{interval, sleep, Duration};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::unix_now;
use crate::zones::{calc_swing_zones, snap_dca_levels, SnapSource};

use super::persist_trade_by_id;

pub async fn run_zone_refresh(state: Arc<AppState>) {
    let period = Duration::from_secs(state.config.zone_refresh_minutes * 60);
    info!(minutes = state.config.zone_refresh_minutes, "zone refresh loop started");

    let mut ticker = interval(period);
    // The first tick of a tokio interval fires immediately; skip it so the
    // first refresh happens one full period after startup.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if !state.config.zone_snap_enabled {
            continue;
        }

        let symbols: HashSet<String> = state
            .trades
            .active_trades()
            .iter()
            .map(|t| t.symbol.clone())
            .collect();
        if symbols.is_empty() {
            continue;
        }

        info!(count = symbols.len(), "refreshing zones for active symbols");
        for symbol in symbols {
            refresh_symbol(&state, &symbol).await;
            sleep(Duration::from_millis(500)).await;
        }
    }
}

async fn refresh_symbol(state: &Arc<AppState>, symbol: &str) {
    let cfg = &state.config;
    let now = unix_now();

    // Fresh external zones take priority over derived ones.
    if let Some(existing) = state.zones.get(symbol) {
        if existing.source == crate::zones::ZoneSource::External
            && existing.is_valid(now, cfg.zone_stale_minutes)
            && existing.age_minutes(now) < cfg.external_zone_stale_minutes
        {
            return;
        }
    }

    let candles = match state
        .exchange
        .klines(symbol, &cfg.zone_candle_interval, cfg.zone_candle_count)
        .await
    {
        Ok(c) => c,
        Err(e) => {
            warn!(symbol, error = %e, "candle fetch failed during zone refresh");
            return;
        }
    };

    let Some(zones) = calc_swing_zones(symbol, &candles, 5, now) else {
        return;
    };

    if state
        .zones
        .insert_derived(zones.clone(), now, cfg.external_zone_stale_minutes)
    {
        state.store.upsert_zone(&zones).await;
        resnap_active_dcas(state, symbol).await;
    }
}

/// Re-snap resting DCA orders for every trade on `symbol` after a zone
/// update. Called from the refresh loop and from the push endpoints.
pub async fn resnap_active_dcas(state: &Arc<AppState>, symbol: &str) {
    let cfg = &state.config;
    if !cfg.zone_snap_enabled {
        return;
    }

    let now = unix_now();
    let Some(zones) = state
        .zones
        .get(symbol)
        .filter(|z| z.is_valid(now, cfg.zone_stale_minutes))
    else {
        return;
    };

    for trade in state.trades.active_trades() {
        if trade.symbol != symbol {
            continue;
        }

        let filled_mask: Vec<bool> = trade.dca_levels.iter().map(|d| d.filled).collect();
        let levels = snap_dca_levels(
            trade.signal_entry,
            &cfg.dca_spacing_pct,
            Some(&zones),
            trade.side,
            cfg.zone_snap_min_pct,
            &filled_mask,
            cfg.dca_limit_buffer_pct,
        );

        for (i, (new_price, source)) in levels.iter().enumerate() {
            if i == 0 || i >= trade.dca_levels.len() {
                continue;
            }
            let dca = &trade.dca_levels[i];
            if dca.filled
                || dca.order_id.is_empty()
                || matches!(source, SnapSource::Entry | SnapSource::Filled)
            {
                continue;
            }

            // Churn guard: only amend for meaningful shifts.
            let shift_pct = (new_price - dca.price).abs() / dca.price * 100.0;
            if shift_pct < cfg.min_resnap_pct {
                continue;
            }

            match state
                .exchange
                .amend_price(&trade.symbol, &dca.order_id, *new_price, trade.side)
                .await
            {
                Ok(()) => {
                    let _ = state.trades.update(&trade.trade_id, |t| {
                        t.dca_levels[i].price = *new_price;
                        t.dca_levels[i].qty =
                            t.dca_levels[i].margin * t.leverage as f64 / new_price;
                    });
                    persist_trade_by_id(state, &trade.trade_id).await;
                    info!(
                        trade_id = %trade.trade_id,
                        level = i,
                        old_price = dca.price,
                        new_price,
                        shift_pct,
                        source = source.as_str(),
                        "DCA re-snapped"
                    );
                }
                Err(e) => {
                    warn!(
                        trade_id = %trade.trade_id,
                        level = i,
                        error = %e,
                        "DCA amend failed"
                    );
                }
            }
        }
    }
}
