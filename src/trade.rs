// =============================================================================
// Trade model — one position lifecycle from signal to terminal close
// =============================================================================
//
// Life-cycle:
//   Pending   -> Open       (E1 limit fills; market entries start Open)
//   Open      -> DcaActive  (an averaging level fills; TPs switch to avg-based)
//   Open      -> Trailing   (all signal TPs fill)
//   DcaActive -> Trailing   (all avg-based TPs fill)
//   any       -> Closed     (exchange stop fires, timeout, command, trend flip)
//
// All mutation goes through the TradeManager; every field here serializes so
// the whole struct round-trips through the active-trade snapshot table.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Current status of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    /// E1 limit order placed, waiting for fill.
    #[serde(rename = "pending")]
    Pending,
    /// E1 filled, signal-target TPs resting.
    #[serde(rename = "open")]
    Open,
    /// At least one averaging level filled, avg-based TPs resting.
    #[serde(rename = "dca")]
    DcaActive,
    /// All TPs filled, remainder rides an exchange-side trailing stop.
    #[serde(rename = "trailing")]
    Trailing,
    /// Terminal.
    #[serde(rename = "closed")]
    Closed,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Open => write!(f, "open"),
            Self::DcaActive => write!(f, "dca"),
            Self::Trailing => write!(f, "trailing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One entry slot. Index 0 is the primary entry (E1), 1..N are averaging
/// entries at progressively worse prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaLevel {
    pub level: usize,
    /// Trigger price (re-written to the actual fill price on fill).
    pub price: f64,
    /// Quantity in coin units.
    pub qty: f64,
    /// Margin committed to this slot (USD).
    pub margin: f64,
    #[serde(default)]
    pub filled: bool,
    #[serde(default)]
    pub order_id: String,
}

/// A tracked position with its DCA ladder, TP legs, and stop state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    // ── Identity ────────────────────────────────────────────────────────
    pub trade_id: String,
    pub symbol: String,
    pub symbol_display: String,
    pub side: Side,
    #[serde(default)]
    pub batch_id: Option<String>,

    // ── Signal info ─────────────────────────────────────────────────────
    pub signal_entry: f64,
    pub signal_leverage: u32,
    pub leverage: u32,

    // ── Entry ladder ────────────────────────────────────────────────────
    pub dca_levels: Vec<DcaLevel>,

    // ── Position state ──────────────────────────────────────────────────
    pub status: TradeStatus,
    #[serde(default)]
    pub total_qty: f64,
    #[serde(default)]
    pub total_margin: f64,
    #[serde(default)]
    pub avg_price: f64,
    /// Highest filled averaging index (0 = only E1).
    #[serde(default)]
    pub current_dca: usize,
    pub max_dca: usize,

    // ── Take-profit legs ────────────────────────────────────────────────
    // Exactly one of {signal-target, avg-based} set is live; the swap
    // happens when a DCA fills.
    #[serde(default)]
    pub tp_prices: Vec<f64>,
    #[serde(default)]
    pub tp_order_ids: Vec<String>,
    #[serde(default)]
    pub tp_filled: Vec<bool>,
    #[serde(default)]
    pub tp_close_pcts: Vec<f64>,
    #[serde(default)]
    pub tp_close_qtys: Vec<f64>,
    #[serde(default)]
    pub tps_hit: usize,
    #[serde(default)]
    pub total_tp_closed_qty: f64,

    // ── Stops ───────────────────────────────────────────────────────────
    #[serde(default)]
    pub hard_sl_price: f64,
    /// One-shot SL tightening after a DCA once the bounce confirms.
    #[serde(default)]
    pub quick_trail_active: bool,

    // ── Scale-in (pyramid at TP2) ───────────────────────────────────────
    #[serde(default)]
    pub scale_in_pending: bool,
    #[serde(default)]
    pub scale_in_filled: bool,
    #[serde(default)]
    pub scale_in_order_id: String,
    #[serde(default)]
    pub scale_in_qty: f64,
    #[serde(default)]
    pub scale_in_price: f64,
    #[serde(default)]
    pub scale_in_margin: f64,

    // ── Timing (unix seconds) ───────────────────────────────────────────
    pub opened_at: f64,
    #[serde(default)]
    pub closed_at: f64,

    // ── P&L ─────────────────────────────────────────────────────────────
    #[serde(default)]
    pub realized_pnl: f64,
    /// (total realized - TP realized) / total margin * 100, set at close.
    #[serde(default)]
    pub trail_pnl_pct: f64,
    #[serde(default)]
    pub equity_at_entry: f64,
}

impl Trade {
    pub fn is_active(&self) -> bool {
        self.status != TradeStatus::Closed
    }

    /// Quantity still in the position after partial TP closes.
    pub fn remaining_qty(&self) -> f64 {
        self.total_qty - self.total_tp_closed_qty
    }

    pub fn age_secs(&self, now: f64) -> f64 {
        if self.opened_at == 0.0 {
            return 0.0;
        }
        let end = if self.closed_at > 0.0 {
            self.closed_at
        } else {
            now
        };
        end - self.opened_at
    }

    pub fn age_hours(&self, now: f64) -> f64 {
        self.age_secs(now) / 3600.0
    }

    /// True once every TP leg has filled (vacuously false with no legs).
    pub fn all_tps_filled(&self) -> bool {
        !self.tp_filled.is_empty() && self.tp_filled.iter().all(|f| *f)
    }

    /// The deepest (worst-priced) filled averaging entry, if any. The hard SL
    /// hangs off this price rather than the average so it can never sit above
    /// the last fill when the ladder is steep.
    pub fn deepest_dca_fill(&self) -> Option<f64> {
        let fills = self
            .dca_levels
            .iter()
            .skip(1)
            .filter(|d| d.filled && d.price > 0.0)
            .map(|d| d.price);
        match self.side {
            Side::Long => fills.fold(None, |acc: Option<f64>, p| {
                Some(acc.map_or(p, |a| a.min(p)))
            }),
            Side::Short => fills.fold(None, |acc: Option<f64>, p| {
                Some(acc.map_or(p, |a| a.max(p)))
            }),
        }
    }
}

/// Immutable journal snapshot written when a trade reaches terminal close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub avg_price: f64,
    pub close_price: f64,
    pub total_qty: f64,
    pub total_margin: f64,
    pub realized_pnl: f64,
    pub max_dca_reached: usize,
    pub tps_hit: usize,
    pub close_reason: String,
    pub opened_at: f64,
    pub closed_at: f64,
    pub signal_leverage: u32,
    pub equity_at_entry: f64,
    pub equity_at_close: f64,
    pub trail_pnl_pct: f64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> Trade {
        Trade {
            trade_id: "FOOUSDT_1712000000_1".into(),
            symbol: "FOOUSDT".into(),
            symbol_display: "FOO/USDT".into(),
            side: Side::Long,
            batch_id: Some("batch-1".into()),
            signal_entry: 100.0,
            signal_leverage: 50,
            leverage: 20,
            dca_levels: vec![
                DcaLevel {
                    level: 0,
                    price: 100.0,
                    qty: 8.0,
                    margin: 40.0,
                    filled: true,
                    order_id: "e1".into(),
                },
                DcaLevel {
                    level: 1,
                    price: 95.0,
                    qty: 16.8,
                    margin: 80.0,
                    filled: false,
                    order_id: "dca1".into(),
                },
            ],
            status: TradeStatus::Open,
            total_qty: 8.0,
            total_margin: 40.0,
            avg_price: 100.0,
            current_dca: 0,
            max_dca: 1,
            tp_prices: vec![101.0, 102.0],
            tp_order_ids: vec!["a".into(), "b".into()],
            tp_filled: vec![false, false],
            tp_close_pcts: vec![50.0, 10.0],
            tp_close_qtys: vec![4.0, 0.8],
            tps_hit: 0,
            total_tp_closed_qty: 0.0,
            hard_sl_price: 90.0,
            quick_trail_active: false,
            scale_in_pending: false,
            scale_in_filled: false,
            scale_in_order_id: String::new(),
            scale_in_qty: 0.0,
            scale_in_price: 0.0,
            scale_in_margin: 0.0,
            opened_at: 1_712_000_000.0,
            closed_at: 0.0,
            realized_pnl: 0.0,
            trail_pnl_pct: 0.0,
            equity_at_entry: 2400.0,
        }
    }

    #[test]
    fn serde_roundtrip_preserves_observable_fields() {
        let trade = sample_trade();
        let json = serde_json::to_string(&trade).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();

        assert_eq!(back.trade_id, trade.trade_id);
        assert_eq!(back.side, trade.side);
        assert_eq!(back.status, trade.status);
        assert_eq!(back.dca_levels.len(), 2);
        assert!(back.dca_levels[0].filled);
        assert_eq!(back.tp_prices, trade.tp_prices);
        assert_eq!(back.tp_close_qtys, trade.tp_close_qtys);
        assert!((back.avg_price - trade.avg_price).abs() < 1e-12);
        assert!((back.hard_sl_price - trade.hard_sl_price).abs() < 1e-12);
        assert_eq!(back.batch_id.as_deref(), Some("batch-1"));
    }

    #[test]
    fn status_serializes_compact() {
        let json = serde_json::to_string(&TradeStatus::DcaActive).unwrap();
        assert_eq!(json, "\"dca\"");
        let st: TradeStatus = serde_json::from_str("\"trailing\"").unwrap();
        assert_eq!(st, TradeStatus::Trailing);
    }

    #[test]
    fn remaining_qty_subtracts_tp_closes() {
        let mut trade = sample_trade();
        trade.total_tp_closed_qty = 4.8;
        assert!((trade.remaining_qty() - 3.2).abs() < 1e-12);
    }

    #[test]
    fn deepest_fill_ignores_e1_and_picks_worst_price() {
        let mut trade = sample_trade();
        assert_eq!(trade.deepest_dca_fill(), None);

        trade.dca_levels[1].filled = true;
        trade.dca_levels[1].price = 94.8;
        assert_eq!(trade.deepest_dca_fill(), Some(94.8));

        trade.dca_levels.push(DcaLevel {
            level: 2,
            price: 91.0,
            qty: 30.0,
            margin: 160.0,
            filled: true,
            order_id: String::new(),
        });
        assert_eq!(trade.deepest_dca_fill(), Some(91.0));

        // For shorts the deepest fill is the highest price.
        trade.side = Side::Short;
        assert_eq!(trade.deepest_dca_fill(), Some(94.8));
    }

    #[test]
    fn all_tps_filled_requires_legs() {
        let mut trade = sample_trade();
        assert!(!trade.all_tps_filled());
        trade.tp_filled = vec![true, true];
        assert!(trade.all_tps_filled());
        trade.tp_filled.clear();
        assert!(!trade.all_tps_filled());
    }
}
