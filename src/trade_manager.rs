// =============================================================================
// Trade Manager — owns the live trade set and every state mutation
// =============================================================================
//
// The manager is the only component that mutates Trade fields. The
// orchestrator loops deliver fill/close events through the methods below and
// receive a post-mutation snapshot back; persistence of that snapshot is the
// caller's job so no lock is ever held across an await.
//
// Thread-safety: the trade map lives behind a parking_lot::RwLock; distinct
// trades may be processed concurrently, compound sequences on one trade are
// serialized by the price-monitor loop.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::bybit::round_qty;
use crate::config::BotConfig;
use crate::parser::Signal;
use crate::trade::{ClosedTrade, DcaLevel, Trade, TradeStatus};
use crate::types::{unix_now, Side};

/// Running win/loss counters for the dashboard.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TradeCounters {
    pub wins: u64,
    pub losses: u64,
    pub breakeven: u64,
    pub total_pnl: f64,
}

pub struct TradeManager {
    config: BotConfig,
    trades: RwLock<HashMap<String, Trade>>,
    counter: AtomicU64,
    counters: RwLock<TradeCounters>,
}

impl TradeManager {
    pub fn new(config: BotConfig) -> Self {
        Self {
            config,
            trades: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
            counters: RwLock::new(TradeCounters::default()),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, trade_id: &str) -> Option<Trade> {
        self.trades.read().get(trade_id).cloned()
    }

    pub fn active_trades(&self) -> Vec<Trade> {
        self.trades
            .read()
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.trades.read().values().filter(|t| t.is_active()).count()
    }

    pub fn find_by_symbol(&self, symbol: &str) -> Option<Trade> {
        self.trades
            .read()
            .values()
            .find(|t| t.is_active() && (t.symbol == symbol || t.symbol_display == symbol))
            .cloned()
    }

    pub fn counters(&self) -> TradeCounters {
        *self.counters.read()
    }

    /// Admission gate: slots, per-symbol uniqueness, coin lists.
    pub fn can_open_trade(&self, symbol: &str) -> Result<(), String> {
        if self.active_count() >= self.config.max_simultaneous_trades {
            return Err(format!(
                "max {} trades reached",
                self.config.max_simultaneous_trades
            ));
        }

        if self.find_by_symbol(symbol).is_some() {
            return Err(format!("already in {symbol}"));
        }

        let base = symbol.trim_end_matches("USDT");
        if self.config.blocked_coins.iter().any(|c| c == base) {
            return Err(format!("{base} is blocked"));
        }
        if !self.config.allowed_coins.is_empty()
            && !self.config.allowed_coins.iter().any(|c| c == base)
        {
            return Err(format!("{base} not in allowed list"));
        }

        Ok(())
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Build a trade from a signal: size the DCA ladder from equity, seed the
    /// signal-target TP legs, and register it.
    pub fn create_trade(&self, signal: &Signal, equity: f64) -> Trade {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let trade_id = format!("{}_{}_{}", signal.symbol, unix_now() as i64, n);

        let cfg = &self.config;
        let mut dca_levels = Vec::with_capacity(cfg.max_dca_levels + 1);
        for level in 0..=cfg.max_dca_levels {
            let price = cfg.level_price(signal.entry_price, level, signal.side);
            let margin = cfg.level_margin(equity, level);
            let qty = margin * cfg.leverage as f64 / price;
            dca_levels.push(DcaLevel {
                level,
                price,
                qty,
                margin,
                filled: false,
                order_id: String::new(),
            });
        }

        let status = if cfg.e1_limit_order {
            TradeStatus::Pending
        } else {
            TradeStatus::Open
        };
        let (total_qty, total_margin) = if status == TradeStatus::Pending {
            (0.0, 0.0)
        } else {
            (dca_levels[0].qty, dca_levels[0].margin)
        };

        // Signal-target TPs: pair the configured close percentages with the
        // signal's targets, truncating to the shorter of the two.
        let legs = cfg.tp_close_pcts.len().min(signal.targets.len());
        let tp_prices: Vec<f64> = signal.targets.iter().take(legs).copied().collect();
        let tp_close_pcts: Vec<f64> = cfg.tp_close_pcts.iter().take(legs).copied().collect();

        let trade = Trade {
            trade_id: trade_id.clone(),
            symbol: signal.symbol.clone(),
            symbol_display: signal.symbol_display.clone(),
            side: signal.side,
            batch_id: None,
            signal_entry: signal.entry_price,
            signal_leverage: signal.signal_leverage,
            leverage: cfg.leverage,
            dca_levels,
            status,
            total_qty,
            total_margin,
            avg_price: signal.entry_price,
            current_dca: 0,
            max_dca: cfg.max_dca_levels,
            tp_prices,
            tp_order_ids: vec![String::new(); legs],
            tp_filled: vec![false; legs],
            tp_close_pcts,
            tp_close_qtys: Vec::new(),
            tps_hit: 0,
            total_tp_closed_qty: 0.0,
            hard_sl_price: 0.0,
            quick_trail_active: false,
            scale_in_pending: false,
            scale_in_filled: false,
            scale_in_order_id: String::new(),
            scale_in_qty: 0.0,
            scale_in_price: 0.0,
            scale_in_margin: 0.0,
            opened_at: unix_now(),
            closed_at: 0.0,
            realized_pnl: 0.0,
            trail_pnl_pct: 0.0,
            equity_at_entry: equity,
        };

        info!(
            trade_id = %trade.trade_id,
            side = %trade.side,
            symbol = %trade.symbol_display,
            entry = trade.signal_entry,
            e1_qty = trade.dca_levels[0].qty,
            e1_margin = trade.dca_levels[0].margin,
            targets = ?trade.tp_prices,
            "trade created"
        );

        self.trades.write().insert(trade_id, trade.clone());
        trade
    }

    /// Re-register a trade recovered from a snapshot.
    pub fn insert_recovered(&self, trade: Trade) {
        self.counter.fetch_add(1, Ordering::SeqCst);
        info!(
            trade_id = %trade.trade_id,
            status = %trade.status,
            avg = trade.avg_price,
            dca = trade.current_dca,
            sl = trade.hard_sl_price,
            "trade recovered"
        );
        self.trades.write().insert(trade.trade_id.clone(), trade);
    }

    // =========================================================================
    // Mutation primitives
    // =========================================================================

    /// Run `f` on the trade under the write lock and return its result plus
    /// a snapshot. The closure must not block.
    pub fn update<R>(&self, trade_id: &str, f: impl FnOnce(&mut Trade) -> R) -> Option<(R, Trade)> {
        let mut trades = self.trades.write();
        let trade = trades.get_mut(trade_id)?;
        let r = f(trade);
        Some((r, trade.clone()))
    }

    /// Emergency reset: drop every in-memory trade without touching the
    /// exchange. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut trades = self.trades.write();
        let count = trades.len();
        trades.clear();
        count
    }

    /// Overwrite a tracked trade with a locally mutated copy. Used by the
    /// orchestrator after order placement wrote exchange ids into a clone.
    /// A trade that closed in the meantime is not resurrected.
    pub fn replace(&self, trade: Trade) {
        let mut trades = self.trades.write();
        if trades.contains_key(&trade.trade_id) {
            trades.insert(trade.trade_id.clone(), trade);
        }
    }

    // =========================================================================
    // Fill events
    // =========================================================================

    /// Record a DCA level fill: re-quantify at the actual price, fold into
    /// the weighted average, advance the ladder, and re-anchor the hard SL on
    /// the deepest fill.
    pub fn fill_dca(&self, trade_id: &str, level: usize, fill_price: f64) -> Option<Trade> {
        let cfg = self.config.clone();
        let (_, trade) = self.update(trade_id, |trade| {
            apply_dca_fill(trade, &cfg, level, fill_price);
        })?;
        info!(
            trade_id,
            level,
            fill_price,
            avg = trade.avg_price,
            hard_sl = trade.hard_sl_price,
            "DCA filled"
        );
        Some(trade)
    }

    /// Record the E1 fill for a pending limit entry.
    pub fn fill_entry(&self, trade_id: &str, fill_price: f64, filled_qty: f64) -> Option<Trade> {
        let (_, trade) = self.update(trade_id, |trade| {
            let e1 = &mut trade.dca_levels[0];
            e1.filled = true;
            e1.price = fill_price;
            if filled_qty > 0.0 {
                e1.qty = filled_qty;
            }
            trade.avg_price = fill_price;
            trade.total_qty = trade.dca_levels[0].qty;
            trade.total_margin = trade.dca_levels[0].margin;
            trade.status = TradeStatus::Open;
        })?;
        Some(trade)
    }

    /// Compute signal-target TP quantities from the confirmed position size.
    pub fn setup_tp_qtys(&self, trade_id: &str) -> Option<Trade> {
        let (_, trade) = self.update(trade_id, |trade| {
            trade.tp_close_qtys = trade
                .tp_close_pcts
                .iter()
                .map(|pct| trade.total_qty * pct / 100.0)
                .collect();
        })?;
        Some(trade)
    }

    /// Swap the signal-target TP set for avg-based TPs after a DCA fill.
    /// Prices derive from the new average; quantities from the full position.
    pub fn setup_dca_tps(&self, trade_id: &str) -> Option<Trade> {
        let cfg = self.config.clone();
        let (_, trade) = self.update(trade_id, |trade| {
            apply_dca_tp_setup(trade, &cfg);
        })?;
        info!(
            trade_id,
            avg = trade.avg_price,
            prices = ?trade.tp_prices,
            "avg-based TPs set"
        );
        Some(trade)
    }

    /// Drop TP legs whose rounded quantity is below the exchange minimum;
    /// their share joins the trailing remainder. If every leg drops, the
    /// whole position trails.
    pub fn consolidate_tps(&self, trade_id: &str, min_qty: f64, qty_step: f64) -> Option<Trade> {
        let (_, trade) = self.update(trade_id, |trade| {
            consolidate_tp_qtys(trade, min_qty, qty_step);
        })?;
        Some(trade)
    }

    /// Record a TP leg fill and its per-leg realized PnL. All legs filled
    /// moves the trade to TRAILING.
    pub fn record_tp_fill(
        &self,
        trade_id: &str,
        tp_idx: usize,
        closed_qty: f64,
        fill_price: f64,
    ) -> Option<Trade> {
        let (recorded, trade) = self.update(trade_id, |trade| {
            apply_tp_fill(trade, tp_idx, closed_qty, fill_price)
        })?;
        if recorded {
            info!(
                trade_id,
                tp = tp_idx + 1,
                closed_qty,
                fill_price,
                tps_hit = trade.tps_hit,
                remaining = trade.remaining_qty(),
                "TP filled"
            );
        }
        Some(trade)
    }

    /// Record a filled scale-in: enlarge the position and re-average over the
    /// remaining quantity.
    pub fn fill_scale_in(
        &self,
        trade_id: &str,
        fill_price: f64,
        added_qty: f64,
        margin: f64,
    ) -> Option<Trade> {
        let (_, trade) = self.update(trade_id, |trade| {
            apply_scale_in_fill(trade, fill_price, added_qty, margin);
        })?;
        info!(
            trade_id,
            fill_price,
            added_qty,
            avg = trade.avg_price,
            "scale-in filled"
        );
        Some(trade)
    }

    /// Redistribute unfilled TP share plus the trailing share across the
    /// enlarged remaining quantity. Prices are unchanged.
    pub fn recalc_tps_after_scale_in(&self, trade_id: &str) -> Option<Trade> {
        let (_, trade) = self.update(trade_id, |trade| {
            recalc_tp_qtys_after_scale_in(trade);
        })?;
        Some(trade)
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Terminal close: remove the trade, fold the result into the running
    /// counters, and emit the journal record. Unfilled trades (E1 never
    /// executed) produce no journal entry.
    pub fn close_trade(
        &self,
        trade_id: &str,
        close_price: f64,
        pnl: f64,
        reason: &str,
    ) -> Option<(Trade, Option<ClosedTrade>)> {
        let mut trade = self.trades.write().remove(trade_id)?;

        let was_filled = trade.total_qty > 0.0;
        trade.status = TradeStatus::Closed;
        trade.closed_at = unix_now();

        // Trail contribution: whatever the final close added beyond the TP
        // legs, normalized by margin so trades of any size compare.
        if was_filled && trade.total_margin > 0.0 {
            let tp_pnl = trade.realized_pnl;
            trade.trail_pnl_pct = (pnl - tp_pnl) / trade.total_margin * 100.0;
        }
        trade.realized_pnl = pnl;

        let record = if was_filled {
            let mut counters = self.counters.write();
            if pnl > 0.01 {
                counters.wins += 1;
            } else if pnl < -0.01 {
                counters.losses += 1;
            } else {
                counters.breakeven += 1;
            }
            counters.total_pnl += pnl;

            Some(ClosedTrade {
                trade_id: trade.trade_id.clone(),
                symbol: trade.symbol.clone(),
                side: trade.side,
                entry_price: trade.signal_entry,
                avg_price: trade.avg_price,
                close_price,
                total_qty: trade.total_qty,
                total_margin: trade.total_margin,
                realized_pnl: pnl,
                max_dca_reached: trade.current_dca,
                tps_hit: trade.tps_hit,
                close_reason: reason.to_string(),
                opened_at: trade.opened_at,
                closed_at: trade.closed_at,
                signal_leverage: trade.signal_leverage,
                equity_at_entry: trade.equity_at_entry,
                equity_at_close: trade.equity_at_entry + pnl,
                trail_pnl_pct: trade.trail_pnl_pct,
            })
        } else {
            None
        };

        let counters = self.counters();
        info!(
            trade_id,
            symbol = %trade.symbol_display,
            side = %trade.side,
            pnl,
            trail_pnl_pct = trade.trail_pnl_pct,
            reason,
            dca = trade.current_dca,
            tps = trade.tps_hit,
            wins = counters.wins,
            losses = counters.losses,
            total_pnl = counters.total_pnl,
            "trade closed"
        );

        Some((trade, record))
    }
}

// =============================================================================
// Pure state transitions
// =============================================================================

fn apply_dca_fill(trade: &mut Trade, cfg: &BotConfig, level: usize, fill_price: f64) {
    if level == 0 || level >= trade.dca_levels.len() {
        warn!(trade_id = %trade.trade_id, level, "DCA fill for unknown level ignored");
        return;
    }

    let leverage = trade.leverage as f64;
    let dca = &mut trade.dca_levels[level];
    dca.filled = true;
    dca.price = fill_price;
    // Re-quantify from the actual fill price.
    let actual_qty = dca.margin * leverage / fill_price;
    dca.qty = actual_qty;
    let margin = dca.margin;

    let old_cost = trade.avg_price * trade.total_qty;
    trade.total_qty += actual_qty;
    trade.total_margin += margin;
    trade.avg_price = (old_cost + fill_price * actual_qty) / trade.total_qty;
    trade.current_dca = trade.current_dca.max(level);
    trade.status = TradeStatus::DcaActive;

    update_hard_sl(trade, cfg);
}

/// Hard SL anchors on the deepest filled DCA price, not the average, so a
/// steep ladder can never leave the stop above the last fill.
fn update_hard_sl(trade: &mut Trade, cfg: &BotConfig) {
    let sl_pct = cfg.hard_sl_pct / 100.0;
    let anchor = trade.deepest_dca_fill().unwrap_or(trade.avg_price);
    trade.hard_sl_price = match trade.side {
        Side::Long => anchor * (1.0 - sl_pct),
        Side::Short => anchor * (1.0 + sl_pct),
    };
}

fn apply_dca_tp_setup(trade: &mut Trade, cfg: &BotConfig) {
    trade.tp_prices = cfg
        .dca_tp_pcts
        .iter()
        .map(|pct| match trade.side {
            Side::Long => trade.avg_price * (1.0 + pct / 100.0),
            Side::Short => trade.avg_price * (1.0 - pct / 100.0),
        })
        .collect();

    let legs = trade.tp_prices.len();
    trade.tp_filled = vec![false; legs];
    trade.tp_order_ids = vec![String::new(); legs];
    trade.tp_close_pcts = cfg.dca_tp_close_pcts.iter().take(legs).copied().collect();
    trade.tps_hit = 0;
    trade.total_tp_closed_qty = 0.0;
    trade.tp_close_qtys = trade
        .tp_close_pcts
        .iter()
        .map(|pct| trade.total_qty * pct / 100.0)
        .collect();
}

fn consolidate_tp_qtys(trade: &mut Trade, min_qty: f64, qty_step: f64) {
    let valid: Vec<usize> = trade
        .tp_close_qtys
        .iter()
        .enumerate()
        .filter(|(_, qty)| round_qty(**qty, qty_step) >= min_qty)
        .map(|(i, _)| i)
        .collect();

    if valid.len() == trade.tp_close_qtys.len() {
        return;
    }

    if valid.is_empty() {
        warn!(
            trade_id = %trade.trade_id,
            "all TPs below min qty, trailing entire position"
        );
        trade.tp_prices.clear();
        trade.tp_close_pcts.clear();
        trade.tp_close_qtys.clear();
        trade.tp_filled.clear();
        trade.tp_order_ids.clear();
        trade.status = TradeStatus::Trailing;
        return;
    }

    trade.tp_prices = valid.iter().map(|&i| trade.tp_prices[i]).collect();
    trade.tp_close_pcts = valid.iter().map(|&i| trade.tp_close_pcts[i]).collect();
    trade.tp_close_qtys = valid.iter().map(|&i| trade.tp_close_qtys[i]).collect();
    trade.tp_filled = vec![false; valid.len()];
    trade.tp_order_ids = vec![String::new(); valid.len()];

    info!(
        trade_id = %trade.trade_id,
        kept = valid.len(),
        trail_pct = 100.0 - trade.tp_close_pcts.iter().sum::<f64>(),
        "TPs consolidated"
    );
}

fn apply_tp_fill(trade: &mut Trade, tp_idx: usize, closed_qty: f64, fill_price: f64) -> bool {
    if tp_idx >= trade.tp_filled.len() || trade.tp_filled[tp_idx] {
        return false;
    }

    trade.tp_filled[tp_idx] = true;
    trade.tps_hit += 1;
    trade.total_tp_closed_qty += closed_qty;

    let pnl = trade.side.sign() * (fill_price - trade.avg_price) * closed_qty;
    trade.realized_pnl += pnl;

    if trade.all_tps_filled() {
        trade.status = TradeStatus::Trailing;
    }
    true
}

fn apply_scale_in_fill(trade: &mut Trade, fill_price: f64, added_qty: f64, margin: f64) {
    let remaining = trade.remaining_qty();
    let old_cost = trade.avg_price * remaining;
    let new_remaining = remaining + added_qty;
    if new_remaining > 0.0 {
        trade.avg_price = (old_cost + fill_price * added_qty) / new_remaining;
    }
    trade.total_qty += added_qty;
    trade.total_margin += margin;
    trade.scale_in_pending = false;
    trade.scale_in_filled = true;
    trade.scale_in_qty = added_qty;
    trade.scale_in_price = fill_price;
    trade.scale_in_margin = margin;
}

fn recalc_tp_qtys_after_scale_in(trade: &mut Trade) {
    let remaining = trade.remaining_qty();

    let unfilled: Vec<usize> = (0..trade.tp_filled.len())
        .filter(|&i| !trade.tp_filled[i])
        .collect();
    let unfilled_pct: f64 = unfilled.iter().map(|&i| trade.tp_close_pcts[i]).sum();
    let trail_pct = 100.0 - trade.tp_close_pcts.iter().sum::<f64>();
    let total_share = unfilled_pct + trail_pct;
    if total_share <= 0.0 {
        return;
    }

    for &i in &unfilled {
        trade.tp_close_qtys[i] = remaining * trade.tp_close_pcts[i] / total_share;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long_signal() -> Signal {
        Signal {
            side: Side::Long,
            symbol: "FOOUSDT".into(),
            symbol_display: "FOO/USDT".into(),
            entry_price: 100.0,
            targets: vec![101.0, 102.0, 103.0, 104.0],
            signal_leverage: 50,
        }
    }

    fn manager() -> TradeManager {
        TradeManager::new(BotConfig::default())
    }

    fn opened_trade(mgr: &TradeManager) -> Trade {
        // Create, then simulate the E1 limit fill at the signal price.
        let trade = mgr.create_trade(&long_signal(), 2400.0);
        let trade = mgr.fill_entry(&trade.trade_id, 100.0, 0.0).unwrap();
        let _ = mgr.update(&trade.trade_id, |t| t.dca_levels[0].filled = true);
        mgr.setup_tp_qtys(&trade.trade_id).unwrap()
    }

    #[test]
    fn sizing_from_equity_and_multipliers() {
        // Equity 2400, 5% budget, 20x, multipliers [1,2]: E1 margin 40,
        // notional 800, qty 8.0 at entry 100.
        let mgr = manager();
        let trade = mgr.create_trade(&long_signal(), 2400.0);

        assert_eq!(trade.status, TradeStatus::Pending);
        assert_eq!(trade.dca_levels.len(), 2);
        assert!((trade.dca_levels[0].margin - 40.0).abs() < 1e-9);
        assert!((trade.dca_levels[0].qty - 8.0).abs() < 1e-9);
        assert!((trade.dca_levels[1].price - 95.0).abs() < 1e-9);
        assert!((trade.dca_levels[1].margin - 80.0).abs() < 1e-9);
        // Pending limit entry holds no position yet.
        assert_eq!(trade.total_qty, 0.0);
        assert_eq!(trade.tp_prices, vec![101.0, 102.0, 103.0, 104.0]);
        assert_eq!(trade.tp_close_pcts, vec![50.0, 10.0, 10.0, 10.0]);
    }

    #[test]
    fn tp_legs_truncate_to_fewer_targets() {
        let mgr = manager();
        let mut signal = long_signal();
        signal.targets = vec![101.0, 102.0];
        let trade = mgr.create_trade(&signal, 2400.0);
        assert_eq!(trade.tp_prices.len(), 2);
        assert_eq!(trade.tp_close_pcts, vec![50.0, 10.0]);
    }

    #[test]
    fn can_open_trade_gates() {
        let mut cfg = BotConfig::default();
        cfg.max_simultaneous_trades = 1;
        cfg.blocked_coins = vec!["BAR".into()];
        let mgr = TradeManager::new(cfg);

        assert!(mgr.can_open_trade("BARUSDT").is_err());
        assert!(mgr.can_open_trade("FOOUSDT").is_ok());

        mgr.create_trade(&long_signal(), 2400.0);
        // Duplicate symbol and exhausted slots both reject.
        assert!(mgr.can_open_trade("FOOUSDT").is_err());
        assert!(mgr.can_open_trade("BAZUSDT").is_err());
    }

    #[test]
    fn tp_qtys_follow_close_pcts() {
        let mgr = manager();
        let trade = opened_trade(&mgr);
        assert!((trade.total_qty - 8.0).abs() < 1e-9);
        assert_eq!(trade.tp_close_qtys.len(), 4);
        assert!((trade.tp_close_qtys[0] - 4.0).abs() < 1e-9);
        assert!((trade.tp_close_qtys[1] - 0.8).abs() < 1e-9);
    }

    #[test]
    fn dca_fill_reaverages_and_anchors_sl_on_deepest_fill() {
        let mgr = manager();
        let trade = opened_trade(&mgr);

        let trade = mgr.fill_dca(&trade.trade_id, 1, 95.0).unwrap();

        assert_eq!(trade.status, TradeStatus::DcaActive);
        assert_eq!(trade.current_dca, 1);

        // DCA1: 80 margin * 20x / 95 = 16.8421... coins.
        let dca_qty = 80.0 * 20.0 / 95.0;
        assert!((trade.total_qty - (8.0 + dca_qty)).abs() < 1e-9);
        assert!((trade.total_margin - 120.0).abs() < 1e-9);

        // Weighted average over filled quantities.
        let expected_avg = (8.0 * 100.0 + dca_qty * 95.0) / (8.0 + dca_qty);
        assert!((trade.avg_price - expected_avg).abs() < 1e-9 * expected_avg);

        // Hard SL from the fill price, not the average: 95 * 0.97 = 92.15.
        assert!((trade.hard_sl_price - 92.15).abs() < 1e-9);
    }

    #[test]
    fn dca_tps_derive_from_average() {
        let mgr = manager();
        let trade = opened_trade(&mgr);
        let trade = mgr.fill_dca(&trade.trade_id, 1, 95.0).unwrap();
        let avg = trade.avg_price;

        let trade = mgr.setup_dca_tps(&trade.trade_id).unwrap();
        assert_eq!(trade.tp_prices.len(), 2);
        assert!((trade.tp_prices[0] - avg * 1.005).abs() < 1e-9);
        assert!((trade.tp_prices[1] - avg * 1.0125).abs() < 1e-9);
        assert_eq!(trade.tp_close_pcts, vec![50.0, 20.0]);
        assert_eq!(trade.tps_hit, 0);
        assert!((trade.tp_close_qtys[0] - trade.total_qty * 0.5).abs() < 1e-9);
    }

    #[test]
    fn dca_tps_invert_for_shorts() {
        let mgr = manager();
        let mut signal = long_signal();
        signal.side = Side::Short;
        signal.targets = vec![99.0, 98.0, 97.0, 96.0];
        let trade = mgr.create_trade(&signal, 2400.0);
        mgr.fill_entry(&trade.trade_id, 100.0, 0.0).unwrap();
        let _ = mgr.update(&trade.trade_id, |t| t.dca_levels[0].filled = true);
        let trade = mgr.fill_dca(&trade.trade_id, 1, 105.0).unwrap();
        let avg = trade.avg_price;

        // Short hard SL sits above the fill.
        assert!((trade.hard_sl_price - 105.0 * 1.03).abs() < 1e-9);

        let trade = mgr.setup_dca_tps(&trade.trade_id).unwrap();
        assert!((trade.tp_prices[0] - avg * 0.995).abs() < 1e-9);
        assert!((trade.tp_prices[1] - avg * 0.9875).abs() < 1e-9);
    }

    #[test]
    fn consolidation_drops_small_legs_into_trail() {
        let mgr = manager();
        let trade = opened_trade(&mgr);

        // min_qty 1.0: the 10% legs (0.8) drop, the 50% leg (4.0) stays.
        let trade = mgr.consolidate_tps(&trade.trade_id, 1.0, 0.01).unwrap();
        assert_eq!(trade.tp_prices, vec![101.0]);
        assert_eq!(trade.tp_close_pcts, vec![50.0]);
        assert_eq!(trade.tp_close_qtys.len(), 1);
        assert_eq!(trade.tp_filled, vec![false]);
        assert_eq!(trade.status, TradeStatus::Open);
    }

    #[test]
    fn consolidation_with_no_survivors_trails_everything() {
        let mgr = manager();
        let trade = opened_trade(&mgr);

        let trade = mgr.consolidate_tps(&trade.trade_id, 100.0, 0.01).unwrap();
        assert!(trade.tp_prices.is_empty());
        assert!(trade.tp_close_qtys.is_empty());
        assert_eq!(trade.status, TradeStatus::Trailing);
    }

    #[test]
    fn consolidation_keeps_all_when_all_fit() {
        let mgr = manager();
        let trade = opened_trade(&mgr);
        let trade = mgr.consolidate_tps(&trade.trade_id, 0.01, 0.01).unwrap();
        assert_eq!(trade.tp_prices.len(), 4);
    }

    #[test]
    fn tp_fills_accumulate_and_trigger_trailing() {
        let mgr = manager();
        let trade = opened_trade(&mgr);
        let id = trade.trade_id.clone();

        let t = mgr.record_tp_fill(&id, 0, 4.0, 101.0).unwrap();
        assert_eq!(t.tps_hit, 1);
        assert!((t.realized_pnl - 4.0).abs() < 1e-9);
        assert!((t.total_tp_closed_qty - 4.0).abs() < 1e-9);
        assert_eq!(t.status, TradeStatus::Open);

        // Double-record of the same leg is ignored.
        let t = mgr.record_tp_fill(&id, 0, 4.0, 101.0).unwrap();
        assert_eq!(t.tps_hit, 1);

        mgr.record_tp_fill(&id, 1, 0.8, 102.0).unwrap();
        mgr.record_tp_fill(&id, 2, 0.8, 103.0).unwrap();
        let t = mgr.record_tp_fill(&id, 3, 0.8, 104.0).unwrap();

        assert_eq!(t.tps_hit, 4);
        assert_eq!(t.status, TradeStatus::Trailing);
        // 4.0*1 + 0.8*2 + 0.8*3 + 0.8*4
        assert!((t.realized_pnl - (4.0 + 1.6 + 2.4 + 3.2)).abs() < 1e-9);
        assert!((t.remaining_qty() - 1.6).abs() < 1e-9);
    }

    #[test]
    fn scale_in_reaverages_remaining_and_redistributes() {
        let mgr = manager();
        let trade = opened_trade(&mgr);
        let id = trade.trade_id.clone();

        // TP1 and TP2 fill, then a scale-in at the TP2 price.
        mgr.record_tp_fill(&id, 0, 4.0, 101.0).unwrap();
        mgr.record_tp_fill(&id, 1, 0.8, 102.0).unwrap();

        let t = mgr.fill_scale_in(&id, 102.0, 8.0, 40.0).unwrap();
        assert!(t.scale_in_filled);
        assert!(!t.scale_in_pending);
        // Remaining before: 3.2 @ avg 100; adding 8 @ 102.
        let expected_avg = (3.2 * 100.0 + 8.0 * 102.0) / 11.2;
        assert!((t.avg_price - expected_avg).abs() < 1e-9);
        assert!((t.remaining_qty() - 11.2).abs() < 1e-9);

        let t = mgr.recalc_tps_after_scale_in(&id).unwrap();
        // Unfilled legs TP3/TP4 (10% each) plus 20% trail share the 11.2.
        assert!((t.tp_close_qtys[2] - 11.2 * 10.0 / 40.0).abs() < 1e-9);
        assert!((t.tp_close_qtys[3] - 11.2 * 10.0 / 40.0).abs() < 1e-9);
        // Filled legs keep their recorded quantities.
        assert!((t.tp_close_qtys[0] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn close_computes_trail_share_and_counters() {
        let mgr = manager();
        let trade = opened_trade(&mgr);
        let id = trade.trade_id.clone();

        mgr.record_tp_fill(&id, 0, 4.0, 101.0).unwrap();
        // Total PnL 10.0 of which 4.0 came from the TP leg.
        let (closed, record) = mgr.close_trade(&id, 103.0, 10.0, "Trailing stop").unwrap();

        assert_eq!(closed.status, TradeStatus::Closed);
        assert!(closed.closed_at > 0.0);
        assert!((closed.realized_pnl - 10.0).abs() < 1e-9);
        // (10 - 4) / 40 margin * 100 = 15%.
        assert!((closed.trail_pnl_pct - 15.0).abs() < 1e-9);

        let record = record.unwrap();
        assert_eq!(record.close_reason, "Trailing stop");
        assert!((record.equity_at_close - 2410.0).abs() < 1e-9);

        let counters = mgr.counters();
        assert_eq!(counters.wins, 1);
        assert_eq!(counters.losses, 0);
        assert!((counters.total_pnl - 10.0).abs() < 1e-9);

        assert!(mgr.get(&id).is_none());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn unfilled_close_produces_no_journal_entry() {
        let mgr = manager();
        let trade = mgr.create_trade(&long_signal(), 2400.0);
        let (closed, record) = mgr
            .close_trade(&trade.trade_id, 0.0, 0.0, "E1 timeout (10min)")
            .unwrap();
        assert!(record.is_none());
        assert_eq!(closed.status, TradeStatus::Closed);
        let counters = mgr.counters();
        assert_eq!(counters.wins + counters.losses + counters.breakeven, 0);
    }

    #[test]
    fn breakeven_and_loss_counters() {
        let mgr = manager();

        let t1 = opened_trade(&mgr);
        mgr.close_trade(&t1.trade_id, 100.0, 0.0, "SL hit").unwrap();

        let mut signal = long_signal();
        signal.symbol = "BARUSDT".into();
        signal.symbol_display = "BAR/USDT".into();
        let t2 = mgr.create_trade(&signal, 2400.0);
        mgr.fill_entry(&t2.trade_id, 100.0, 0.0).unwrap();
        mgr.close_trade(&t2.trade_id, 90.0, -8.0, "SL hit").unwrap();

        let counters = mgr.counters();
        assert_eq!(counters.breakeven, 1);
        assert_eq!(counters.losses, 1);
        assert!((counters.total_pnl + 8.0).abs() < 1e-9);
    }
}
