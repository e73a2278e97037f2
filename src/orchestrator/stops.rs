// =============================================================================
// Stop-ladder arithmetic — pure price helpers shared by the monitor, safety,
// and recovery paths
// =============================================================================

use crate::trade::{Trade, TradeStatus};
use crate::types::Side;

/// A stop `pct` percent beyond `price` on the losing side: below for longs,
/// above for shorts.
pub fn protective_stop(price: f64, pct: f64, side: Side) -> f64 {
    match side {
        Side::Long => price * (1.0 - pct / 100.0),
        Side::Short => price * (1.0 + pct / 100.0),
    }
}

/// A price `pct` percent beyond `price` on the winning side: above for longs,
/// below for shorts. Used for break-even buffers and TP distances.
pub fn favorable_offset(price: f64, pct: f64, side: Side) -> f64 {
    match side {
        Side::Long => price * (1.0 + pct / 100.0),
        Side::Short => price * (1.0 - pct / 100.0),
    }
}

/// Break-even stop after TP1: entry nudged slightly into profit so the exit
/// covers fees.
pub fn breakeven_price(entry: f64, buffer_pct: f64, side: Side) -> f64 {
    favorable_offset(entry, buffer_pct, side)
}

/// Trailing callback distance in price units at the given reference price.
pub fn trailing_distance(reference_price: f64, callback_pct: f64) -> f64 {
    reference_price * callback_pct / 100.0
}

/// Has price moved at least `trigger_pct` percent in the trade's favor from
/// the average entry?
pub fn quick_trail_triggered(side: Side, avg_price: f64, mark: f64, trigger_pct: f64) -> bool {
    if avg_price <= 0.0 || mark <= 0.0 {
        return false;
    }
    match side {
        Side::Long => mark >= avg_price * (1.0 + trigger_pct / 100.0),
        Side::Short => mark <= avg_price * (1.0 - trigger_pct / 100.0),
    }
}

/// Derive the close reason when the exchange reports the position gone.
pub fn vanished_close_reason(trade: &Trade) -> String {
    let mut reason = if trade.status == TradeStatus::Trailing {
        "Trailing stop".to_string()
    } else if trade.tps_hit > 0 {
        format!("SL (at TP{} level)", trade.tps_hit)
    } else {
        "SL hit".to_string()
    };
    if trade.tps_hit > 0 {
        reason.push_str(&format!(" after TP{}", trade.tps_hit));
    }
    reason
}

/// Fills observed so far within a batch (anything no longer PENDING).
pub fn batch_fill_count(trades: &[Trade], batch_id: &str) -> usize {
    trades
        .iter()
        .filter(|t| {
            t.batch_id.as_deref() == Some(batch_id) && t.status != TradeStatus::Pending
        })
        .count()
}

/// Still-pending members of a batch, candidates for the batch-cap sweep.
pub fn pending_batch_siblings<'a>(trades: &'a [Trade], batch_id: &str) -> Vec<&'a Trade> {
    trades
        .iter()
        .filter(|t| {
            t.batch_id.as_deref() == Some(batch_id) && t.status == TradeStatus::Pending
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::trade::DcaLevel;

    fn trade_with(status: TradeStatus, tps_hit: usize, batch: Option<&str>) -> Trade {
        Trade {
            trade_id: "T".into(),
            symbol: "FOOUSDT".into(),
            symbol_display: "FOO/USDT".into(),
            side: Side::Long,
            batch_id: batch.map(|s| s.to_string()),
            signal_entry: 100.0,
            signal_leverage: 50,
            leverage: 20,
            dca_levels: vec![DcaLevel {
                level: 0,
                price: 100.0,
                qty: 8.0,
                margin: 40.0,
                filled: true,
                order_id: String::new(),
            }],
            status,
            total_qty: 8.0,
            total_margin: 40.0,
            avg_price: 100.0,
            current_dca: 0,
            max_dca: 1,
            tp_prices: vec![],
            tp_order_ids: vec![],
            tp_filled: vec![],
            tp_close_pcts: vec![],
            tp_close_qtys: vec![],
            tps_hit,
            total_tp_closed_qty: 0.0,
            hard_sl_price: 0.0,
            quick_trail_active: false,
            scale_in_pending: false,
            scale_in_filled: false,
            scale_in_order_id: String::new(),
            scale_in_qty: 0.0,
            scale_in_price: 0.0,
            scale_in_margin: 0.0,
            opened_at: 0.0,
            closed_at: 0.0,
            realized_pnl: 0.0,
            trail_pnl_pct: 0.0,
            equity_at_entry: 2400.0,
        }
    }

    #[test]
    fn stops_sit_on_the_losing_side() {
        assert!((protective_stop(100.0, 10.0, Side::Long) - 90.0).abs() < 1e-9);
        assert!((protective_stop(100.0, 3.0, Side::Short) - 103.0).abs() < 1e-9);
        assert!((protective_stop(95.0, 3.0, Side::Long) - 92.15).abs() < 1e-9);
    }

    #[test]
    fn favorable_offsets_sit_on_the_winning_side() {
        assert!((favorable_offset(100.0, 0.1, Side::Long) - 100.1).abs() < 1e-9);
        assert!((favorable_offset(100.0, 0.1, Side::Short) - 99.9).abs() < 1e-9);
        assert!((breakeven_price(96.667, 0.0, Side::Long) - 96.667).abs() < 1e-9);
    }

    #[test]
    fn trailing_distance_scales_with_reference() {
        assert!((trailing_distance(104.0, 1.0) - 1.04).abs() < 1e-9);
        assert!((trailing_distance(0.00632, 0.5) - 0.0000316).abs() < 1e-12);
    }

    #[test]
    fn quick_trail_trigger_thresholds() {
        assert!(quick_trail_triggered(Side::Long, 100.0, 100.5, 0.5));
        assert!(!quick_trail_triggered(Side::Long, 100.0, 100.4, 0.5));
        assert!(quick_trail_triggered(Side::Short, 100.0, 99.5, 0.5));
        assert!(!quick_trail_triggered(Side::Short, 100.0, 99.6, 0.5));
        assert!(!quick_trail_triggered(Side::Long, 0.0, 100.0, 0.5));
    }

    #[test]
    fn close_reasons_by_state() {
        let t = trade_with(TradeStatus::Trailing, 4, None);
        assert_eq!(vanished_close_reason(&t), "Trailing stop after TP4");

        let t = trade_with(TradeStatus::Open, 2, None);
        assert_eq!(vanished_close_reason(&t), "SL (at TP2 level) after TP2");

        let t = trade_with(TradeStatus::DcaActive, 0, None);
        assert_eq!(vanished_close_reason(&t), "SL hit");
    }

    #[test]
    fn batch_counting_ignores_other_batches() {
        let trades = vec![
            trade_with(TradeStatus::Open, 0, Some("b1")),
            trade_with(TradeStatus::DcaActive, 0, Some("b1")),
            trade_with(TradeStatus::Pending, 0, Some("b1")),
            trade_with(TradeStatus::Open, 0, Some("b2")),
            trade_with(TradeStatus::Open, 0, None),
        ];
        assert_eq!(batch_fill_count(&trades, "b1"), 2);
        assert_eq!(batch_fill_count(&trades, "b2"), 1);
        assert_eq!(pending_batch_siblings(&trades, "b1").len(), 1);
        assert_eq!(pending_batch_siblings(&trades, "b2").len(), 0);
    }
}
