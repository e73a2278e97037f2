// =============================================================================
// Admission — debounced signal batching with a global slot cap and filters
// =============================================================================
//
// Signals land in a buffer; a single-armed debounce timer flushes the batch
// once arrivals go quiet for the batch window. Every new arrival re-arms the
// timer. The flush admits survivors of the trend/zone/slot filters in
// arrival order (no priority sorting) and stamps them with a shared batch id
// so the monitor can enforce the per-batch fill cap.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::parser::Signal;
use crate::types::unix_now;
use crate::zones::{calc_swing_zones, snap_dca_levels, SnapSource};

use super::orders;

/// Outcome of buffering one signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum AdmissionOutcome {
    /// A signal for the same symbol is already buffered.
    Duplicate { symbol: String },
    /// Buffered; the batch flushes after the debounce window.
    Buffered { buffer_size: usize },
}

/// The admission buffer. The generation counter implements the single-armed
/// debounce: every arrival bumps it, and a flush task only fires if its
/// generation is still current when the window elapses.
#[derive(Default)]
pub struct SignalBatch {
    buffer: Mutex<Vec<Signal>>,
    generation: AtomicU64,
}

impl SignalBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }
}

/// Buffer a signal and (re)arm the debounce timer.
pub async fn add_signal(state: &Arc<AppState>, signal: Signal) -> AdmissionOutcome {
    let buffer_size = {
        let mut buffer = state.batch.buffer.lock();
        if buffer.iter().any(|s| s.symbol == signal.symbol) {
            return AdmissionOutcome::Duplicate {
                symbol: signal.symbol_display.clone(),
            };
        }
        info!(
            side = %signal.side,
            symbol = %signal.symbol_display,
            signal_leverage = signal.signal_leverage,
            buffered = buffer.len() + 1,
            window_secs = state.config.batch_window_secs,
            "signal buffered"
        );
        buffer.push(signal);
        buffer.len()
    };

    // Re-arm: invalidate any pending flush, then schedule our own.
    let my_generation = state.batch.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let window = state.config.batch_window_secs;
    let flush_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(window)).await;
        if flush_state.batch.generation.load(Ordering::SeqCst) == my_generation {
            flush_batch(&flush_state).await;
        }
    });

    AdmissionOutcome::Buffered { buffer_size }
}

/// Drain the buffer and admit up to `free_slots` survivors in arrival order.
pub async fn flush_batch(state: &Arc<AppState>) -> Vec<serde_json::Value> {
    let batch: Vec<Signal> = {
        let mut buffer = state.batch.buffer.lock();
        std::mem::take(&mut *buffer)
    };
    if batch.is_empty() {
        return Vec::new();
    }

    let active = state.trades.active_count();
    let free_slots = state
        .config
        .max_simultaneous_trades
        .saturating_sub(active);
    if free_slots == 0 {
        info!(batch = batch.len(), "batch rejected: no free slots");
        return Vec::new();
    }

    // Pre-filter in arrival order.
    let mut survivors = Vec::new();
    for signal in batch {
        if let Some(reason) = filter_signal(state, &signal).await {
            info!(symbol = %signal.symbol_display, reason, "batch pre-filter rejected");
            continue;
        }
        survivors.push(signal);
    }
    if survivors.is_empty() {
        info!("batch fully filtered");
        return Vec::new();
    }

    let selected: Vec<Signal> = survivors.into_iter().take(free_slots).collect();
    let batch_id = format!("batch_{}", Uuid::new_v4().simple());

    info!(
        selected = selected.len(),
        %batch_id,
        max_fills = state.config.max_fills_per_batch,
        symbols = %selected
            .iter()
            .map(|s| s.symbol_display.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        "batch admitted"
    );

    let mut results = Vec::with_capacity(selected.len());
    for signal in selected {
        results.push(execute_signal(state, signal, Some(&batch_id)).await);
    }
    results
}

/// Admission filters: slots/duplicates/coin lists, the signal-leverage
/// window, the trend marker, and the reversal-zone position. Returns the
/// rejection reason, or `None` to admit.
async fn filter_signal(state: &AppState, signal: &Signal) -> Option<String> {
    if let Err(reason) = state.trades.can_open_trade(&signal.symbol) {
        return Some(reason);
    }

    let cfg = &state.config;
    if signal.signal_leverage < cfg.min_leverage_signal
        || signal.signal_leverage > cfg.max_leverage_signal
    {
        return Some(format!(
            "signal leverage {}x outside [{}, {}]",
            signal.signal_leverage, cfg.min_leverage_signal, cfg.max_leverage_signal
        ));
    }

    // Trend filter: admit only signals aligned with the stored marker.
    if cfg.trend_filter_enabled {
        if let Some(trend) = state.store.get_trend(&signal.symbol).await {
            if trend.aligned_side() != signal.side {
                return Some(format!("trend marker is {trend}, signal is {}", signal.side));
            }
        }
    }

    // Zone filter: reject entries already inside the reversal zone.
    if cfg.zone_filter_enabled {
        if let Some(zones) = state.zones.get(&signal.symbol) {
            if zones.is_valid(unix_now(), cfg.zone_stale_minutes) {
                if signal.side == crate::types::Side::Short
                    && zones.s1 > 0.0
                    && signal.entry_price < zones.s1
                {
                    return Some(format!(
                        "short into support: price {} < S1 {}",
                        signal.entry_price, zones.s1
                    ));
                }
                if signal.side == crate::types::Side::Long
                    && zones.r1 > 0.0
                    && signal.entry_price > zones.r1
                {
                    return Some(format!(
                        "long into resistance: price {} > R1 {}",
                        signal.entry_price, zones.r1
                    ));
                }
            }
        }
    }

    None
}

/// The create-and-place sequence for one admitted signal: read equity, build
/// the trade, snap DCA levels onto zones, place E1, persist.
pub async fn execute_signal(
    state: &Arc<AppState>,
    signal: Signal,
    batch_id: Option<&str>,
) -> serde_json::Value {
    if let Err(reason) = state.trades.can_open_trade(&signal.symbol) {
        info!(symbol = %signal.symbol_display, reason, "signal rejected");
        return serde_json::json!({"status": "rejected", "reason": reason});
    }

    // Direct (non-batch) submissions still pass the domain filters.
    if batch_id.is_none() {
        if let Some(reason) = filter_signal(state, &signal).await {
            info!(symbol = %signal.symbol_display, reason, "signal filtered");
            return serde_json::json!({"status": "filtered", "reason": reason});
        }
    }

    let equity = match state.exchange.get_equity().await {
        Ok(e) if e > 0.0 => e,
        Ok(_) | Err(_) => {
            error!(symbol = %signal.symbol_display, "cannot read equity, signal skipped");
            return serde_json::json!({"status": "error", "reason": "cannot read equity"});
        }
    };

    let trade = state.trades.create_trade(&signal, equity);
    let trade_id = trade.trade_id.clone();
    if let Some(batch_id) = batch_id {
        let _ = state
            .trades
            .update(&trade_id, |t| t.batch_id = Some(batch_id.to_string()));
    }

    apply_zone_snap(state, &trade_id).await;

    // Place the entry from a local copy, then commit the order ids.
    let Some(mut placed) = state.trades.get(&trade_id) else {
        return serde_json::json!({"status": "error", "reason": "trade vanished before placement"});
    };
    if let Err(e) = orders::place_entry(state, &mut placed).await {
        error!(symbol = %signal.symbol_display, error = %e, "entry placement failed");
        let _ = super::finalize_close(state, &trade_id, 0.0, 0.0, "Failed to open").await;
        return serde_json::json!({"status": "error", "reason": format!("entry failed: {e}")});
    }
    state.trades.replace(placed.clone());
    super::persist_trade(state, &placed).await;

    info!(
        side = %signal.side,
        symbol = %signal.symbol_display,
        entry = signal.entry_price,
        slots = format!("{}/{}", state.trades.active_count(), state.config.max_simultaneous_trades),
        "trade opened"
    );

    serde_json::json!({
        "status": "opened",
        "trade_id": trade_id,
        "symbol": signal.symbol_display,
        "side": signal.side,
        "e1_price": signal.entry_price,
        "slots_used": state.trades.active_count(),
    })
}

/// Snap unfilled DCA levels onto the current zones at creation time. Falls
/// back to deriving zones from candles when none are cached.
pub async fn apply_zone_snap(state: &AppState, trade_id: &str) {
    let cfg = &state.config;
    if !cfg.zone_snap_enabled {
        return;
    }
    let Some(trade) = state.trades.get(trade_id) else {
        return;
    };

    let now = unix_now();
    let mut zones = state
        .zones
        .get(&trade.symbol)
        .filter(|z| z.is_valid(now, cfg.zone_stale_minutes));

    if zones.is_none() {
        // Derive from candles as fallback.
        match state
            .exchange
            .klines(&trade.symbol, &cfg.zone_candle_interval, cfg.zone_candle_count)
            .await
        {
            Ok(candles) => {
                if let Some(derived) = calc_swing_zones(&trade.symbol, &candles, 5, now) {
                    if state
                        .zones
                        .insert_derived(derived.clone(), now, cfg.external_zone_stale_minutes)
                    {
                        state.store.upsert_zone(&derived).await;
                    }
                    zones = Some(derived);
                }
            }
            Err(e) => warn!(symbol = %trade.symbol, error = %e, "candle fetch for zones failed"),
        }
    }

    let Some(zones) = zones else { return };

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

    let _ = state.trades.update(trade_id, |t| {
        for (i, (price, source)) in levels.iter().enumerate() {
            if i == 0 || i >= t.dca_levels.len() || *source != SnapSource::Zone {
                continue;
            }
            let old = t.dca_levels[i].price;
            t.dca_levels[i].price = *price;
            t.dca_levels[i].qty = t.dca_levels[i].margin * t.leverage as f64 / price;
            info!(
                trade_id = %t.trade_id,
                level = i,
                old_price = old,
                new_price = price,
                "DCA snapped to zone"
            );
        }
    });
}
