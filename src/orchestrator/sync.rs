// =============================================================================
// Closed-PnL sync loop — import exchange-side closes the bot did not drive
// =============================================================================
//
// The exchange ledger emits one record per execution fill; a single close
// order can produce several. Records for the same (symbol, side) within a
// 60-second window are folded into one logical close before dedup against
// the journal. Anything left over (manual closes, liquidations) is persisted
// with reason "Exchange sync". Only records newer than bot start are
// considered so history never re-imports.
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::app_state::AppState;
use crate::bybit::models::ClosedPnlRecord;
use crate::trade::ClosedTrade;
use crate::types::Side;

/// Sync period.
const SYNC_INTERVAL_SECS: u64 = 120;
/// Execution fills of one close land within this window.
const AGGREGATE_WINDOW_SECS: f64 = 60.0;
/// Journal dedup tolerance around open/close timestamps.
const DEDUP_WINDOW_SECS: f64 = 60.0;

/// One logical position close assembled from execution fills.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedClose {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub order_type: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub fill_count: usize,
}

/// Fold per-fill records into per-close records: consecutive records sharing
/// (symbol, side) whose times chain within the window merge, with a
/// quantity-weighted exit price.
pub fn aggregate_closed_pnl(records: &[ClosedPnlRecord]) -> Vec<AggregatedClose> {
    if records.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<&ClosedPnlRecord> = records.iter().collect();
    sorted.sort_by(|a, b| {
        (&a.symbol, a.side.to_string(), a.created_at)
            .partial_cmp(&(&b.symbol, b.side.to_string(), b.created_at))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut aggregated = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut group = vec![sorted[i]];
        let mut j = i + 1;
        while j < sorted.len() {
            let curr = sorted[j];
            let prev = *group.last().expect("group never empty");
            if curr.symbol == prev.symbol
                && curr.side == prev.side
                && (curr.created_at - prev.created_at).abs() <= AGGREGATE_WINDOW_SECS
            {
                group.push(curr);
                j += 1;
            } else {
                break;
            }
        }

        let total_qty: f64 = group.iter().map(|r| r.qty).sum();
        let total_pnl: f64 = group.iter().map(|r| r.realized_pnl).sum();
        let avg_exit = if total_qty > 0.0 {
            group.iter().map(|r| r.qty * r.exit_price).sum::<f64>() / total_qty
        } else {
            group[0].exit_price
        };

        aggregated.push(AggregatedClose {
            symbol: group[0].symbol.clone(),
            side: group[0].side,
            qty: total_qty,
            entry_price: group[0].entry_price,
            exit_price: avg_exit,
            realized_pnl: total_pnl,
            order_type: group[0].order_type.clone(),
            created_at: group[0].created_at,
            updated_at: group.last().expect("group never empty").updated_at,
            fill_count: group.len(),
        });

        i = j;
    }

    aggregated
}

pub async fn run_closed_pnl_sync(state: Arc<AppState>) {
    info!(interval_secs = SYNC_INTERVAL_SECS, "closed-pnl sync started");

    // Only closes after bot start; deleted journal rows never resurrect.
    let sync_start = state.started_at;
    let sync_start_ms = (sync_start * 1000.0) as i64;

    let mut ticker = interval(Duration::from_secs(SYNC_INTERVAL_SECS));
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let records = match state.exchange.closed_pnl(sync_start_ms, 20).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "closed-pnl fetch failed");
                continue;
            }
        };
        if records.is_empty() {
            continue;
        }

        for close in aggregate_closed_pnl(&records) {
            if close.updated_at < sync_start {
                continue;
            }
            import_if_unknown(&state, close).await;
        }
    }
}

/// Persist an aggregated close unless the journal or the live trade set
/// already accounts for it.
async fn import_if_unknown(state: &Arc<AppState>, close: AggregatedClose) {
    let store = &state.store;

    // Bot-written journal rows: match by open time, close time, or any trade
    // whose lifetime contains this close (partial TP fills show up as
    // separate ledger records inside a tracked trade's window).
    if store
        .has_trade_near_open(&close.symbol, close.created_at, DEDUP_WINDOW_SECS)
        .await
        || store
            .has_trade_near_close(&close.symbol, close.updated_at, DEDUP_WINDOW_SECS)
            .await
        || store.has_trade_covering(&close.symbol, close.created_at).await
    {
        return;
    }

    // Actively tracked positions close through the monitor, not here.
    let tracked = state
        .trades
        .active_trades()
        .iter()
        .any(|t| t.symbol == close.symbol && t.side == close.side);
    if tracked {
        return;
    }

    let equity = state.exchange.get_equity().await.unwrap_or(0.0);
    let leverage = state.config.leverage;
    let margin = if leverage > 0 {
        close.qty * close.entry_price / leverage as f64
    } else {
        0.0
    };

    let record = ClosedTrade {
        trade_id: format!(
            "sync_{}_{}_{}",
            close.symbol,
            close.side,
            close.created_at as i64
        ),
        symbol: close.symbol.clone(),
        side: close.side,
        entry_price: close.entry_price,
        avg_price: close.entry_price,
        close_price: close.exit_price,
        total_qty: close.qty,
        total_margin: margin,
        realized_pnl: close.realized_pnl,
        max_dca_reached: 0,
        tps_hit: 0,
        close_reason: format!("Exchange sync ({})", close.order_type),
        opened_at: close.created_at,
        closed_at: close.updated_at,
        signal_leverage: leverage,
        equity_at_entry: equity,
        equity_at_close: equity,
        trail_pnl_pct: 0.0,
    };
    store.save_closed_trade(&record).await;

    info!(
        symbol = %close.symbol,
        side = %close.side,
        pnl = close.realized_pnl,
        qty = close.qty,
        fills = close.fill_count,
        "exchange-side close imported"
    );
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn rec(symbol: &str, side: Side, qty: f64, exit: f64, pnl: f64, t: f64) -> ClosedPnlRecord {
        ClosedPnlRecord {
            symbol: symbol.into(),
            side,
            qty,
            entry_price: 100.0,
            exit_price: exit,
            realized_pnl: pnl,
            order_type: "Market".into(),
            created_at: t,
            updated_at: t + 1.0,
        }
    }

    #[test]
    fn single_fill_close_passes_through() {
        let records = vec![rec("FOOUSDT", Side::Long, 1.6, 104.0, 6.2, 1000.0)];
        let agg = aggregate_closed_pnl(&records);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].fill_count, 1);
        assert!((agg[0].qty - 1.6).abs() < 1e-9);
        assert!((agg[0].exit_price - 104.0).abs() < 1e-9);
    }

    #[test]
    fn multi_fill_close_merges_within_window() {
        // One close order matched against three counterparties over 30 s.
        let records = vec![
            rec("FOOUSDT", Side::Long, 1.0, 104.0, 4.0, 1000.0),
            rec("FOOUSDT", Side::Long, 0.4, 104.1, 1.6, 1015.0),
            rec("FOOUSDT", Side::Long, 0.2, 104.2, 0.8, 1030.0),
        ];
        let agg = aggregate_closed_pnl(&records);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].fill_count, 3);
        assert!((agg[0].qty - 1.6).abs() < 1e-9);
        assert!((agg[0].realized_pnl - 6.4).abs() < 1e-9);
        // Quantity-weighted exit.
        let expected = (1.0 * 104.0 + 0.4 * 104.1 + 0.2 * 104.2) / 1.6;
        assert!((agg[0].exit_price - expected).abs() < 1e-9);
        assert_eq!(agg[0].created_at, 1000.0);
        assert_eq!(agg[0].updated_at, 1031.0);
    }

    #[test]
    fn fills_outside_window_stay_separate() {
        let records = vec![
            rec("FOOUSDT", Side::Long, 1.0, 104.0, 4.0, 1000.0),
            rec("FOOUSDT", Side::Long, 1.0, 98.0, -2.0, 1120.0),
        ];
        let agg = aggregate_closed_pnl(&records);
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn chained_fills_extend_the_window() {
        // Each neighbour is within 60 s of the previous fill even though the
        // first and last are 90 s apart; they are one close.
        let records = vec![
            rec("FOOUSDT", Side::Long, 1.0, 104.0, 4.0, 1000.0),
            rec("FOOUSDT", Side::Long, 1.0, 104.0, 4.0, 1045.0),
            rec("FOOUSDT", Side::Long, 1.0, 104.0, 4.0, 1090.0),
        ];
        let agg = aggregate_closed_pnl(&records);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].fill_count, 3);
    }

    #[test]
    fn different_symbols_and_sides_never_merge() {
        let records = vec![
            rec("FOOUSDT", Side::Long, 1.0, 104.0, 4.0, 1000.0),
            rec("FOOUSDT", Side::Short, 1.0, 96.0, 4.0, 1000.0),
            rec("BARUSDT", Side::Long, 1.0, 104.0, 4.0, 1000.0),
        ];
        let agg = aggregate_closed_pnl(&records);
        assert_eq!(agg.len(), 3);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(aggregate_closed_pnl(&[]).is_empty());
    }
}
