// =============================================================================
// Bot Configuration — JSON file with serde defaults, secrets from environment
// =============================================================================
//
// Every field carries `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. Credentials are never stored in the
// JSON file; they are pulled from environment variables after loading.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Side;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_leverage() -> u32 {
    20
}

fn default_equity_pct_per_trade() -> f64 {
    5.0
}

fn default_max_simultaneous_trades() -> usize {
    6
}

fn default_max_fills_per_batch() -> usize {
    3
}

fn default_batch_window_secs() -> u64 {
    5
}

fn default_e1_timeout_minutes() -> f64 {
    10.0
}

fn default_dca_multipliers() -> Vec<f64> {
    vec![1.0, 2.0]
}

fn default_dca_spacing_pct() -> Vec<f64> {
    vec![0.0, 5.0]
}

fn default_max_dca_levels() -> usize {
    1
}

fn default_tp_close_pcts() -> Vec<f64> {
    vec![50.0, 10.0, 10.0, 10.0]
}

fn default_trailing_callback_pct() -> f64 {
    1.0
}

fn default_be_buffer_pct() -> f64 {
    0.1
}

fn default_safety_sl_pct() -> f64 {
    10.0
}

fn default_hard_sl_pct() -> f64 {
    3.0
}

fn default_dca_tp_pcts() -> Vec<f64> {
    vec![0.5, 1.25]
}

fn default_dca_tp_close_pcts() -> Vec<f64> {
    vec![50.0, 20.0]
}

fn default_dca_trail_callback_pct() -> f64 {
    1.0
}

fn default_quick_trail_trigger_pct() -> f64 {
    0.5
}

fn default_quick_trail_buffer_pct() -> f64 {
    0.5
}

fn default_zone_snap_min_pct() -> f64 {
    2.0
}

fn default_min_resnap_pct() -> f64 {
    0.3
}

fn default_zone_refresh_minutes() -> u64 {
    15
}

fn default_zone_candle_interval() -> String {
    "15".to_string()
}

fn default_zone_candle_count() -> u32 {
    100
}

fn default_zone_stale_minutes() -> f64 {
    120.0
}

fn default_external_zone_stale_minutes() -> f64 {
    60.0
}

fn default_max_leverage_signal() -> u32 {
    100
}

fn default_fallback_signal_leverage() -> u32 {
    50
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for the Helios engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Credentials (environment only, never serialized) -------------------
    #[serde(skip)]
    pub bybit_api_key: String,
    #[serde(skip)]
    pub bybit_api_secret: String,
    #[serde(skip)]
    pub telegram_bot_token: String,
    #[serde(skip)]
    pub database_url: String,

    /// Use the Bybit testnet endpoints.
    #[serde(default = "default_true")]
    pub bybit_testnet: bool,

    /// Telegram chat id the listener accepts signals from (empty = listener
    /// disabled).
    #[serde(default)]
    pub telegram_chat_id: String,

    // --- Server --------------------------------------------------------------
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // --- Capital & risk ------------------------------------------------------
    /// Leverage applied to every trade (signal leverage is recorded only).
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Percent of equity allocated to one trade's full DCA budget.
    #[serde(default = "default_equity_pct_per_trade")]
    pub equity_pct_per_trade: f64,

    /// Global cap on simultaneously active trades.
    #[serde(default = "default_max_simultaneous_trades")]
    pub max_simultaneous_trades: usize,

    /// Within one admission batch, cancel remaining PENDING entries once this
    /// many have filled.
    #[serde(default = "default_max_fills_per_batch")]
    pub max_fills_per_batch: usize,

    /// Debounce window for the signal batch buffer.
    #[serde(default = "default_batch_window_secs")]
    pub batch_window_secs: u64,

    /// Place E1 as a limit at the signal price (false = market).
    #[serde(default = "default_true")]
    pub e1_limit_order: bool,

    /// Cancel an unfilled E1 limit after this many minutes.
    #[serde(default = "default_e1_timeout_minutes")]
    pub e1_timeout_minutes: f64,

    // --- DCA -----------------------------------------------------------------
    /// Margin multiplier per level, index 0 = E1.
    #[serde(default = "default_dca_multipliers")]
    pub dca_multipliers: Vec<f64>,

    /// Spacing from entry per level in percent, index 0 = E1 (always 0).
    #[serde(default = "default_dca_spacing_pct")]
    pub dca_spacing_pct: Vec<f64>,

    /// Number of averaging levels beyond E1.
    #[serde(default = "default_max_dca_levels")]
    pub max_dca_levels: usize,

    // --- Take profit (signal-target mode, pre-DCA) ---------------------------
    /// Close percentage per signal-target TP leg.
    #[serde(default = "default_tp_close_pcts")]
    pub tp_close_pcts: Vec<f64>,

    /// Trailing callback on the remainder after the last TP, in percent.
    #[serde(default = "default_trailing_callback_pct")]
    pub trailing_callback_pct: f64,

    /// Break-even buffer applied when SL moves to entry after TP1.
    #[serde(default = "default_be_buffer_pct")]
    pub be_buffer_pct: f64,

    /// Move SL to break-even after TP1 fills.
    #[serde(default = "default_true")]
    pub sl_to_be_after_tp1: bool,

    /// Wide initial SL below entry that leaves DCA levels room to fill.
    #[serde(default = "default_safety_sl_pct")]
    pub safety_sl_pct: f64,

    // --- DCA exit (avg-based mode) -------------------------------------------
    /// Hard SL distance from the deepest DCA fill.
    #[serde(default = "default_hard_sl_pct")]
    pub hard_sl_pct: f64,

    /// Avg-based TP distances after a DCA fill, in percent from avg.
    #[serde(default = "default_dca_tp_pcts")]
    pub dca_tp_pcts: Vec<f64>,

    /// Close percentage per avg-based TP leg.
    #[serde(default = "default_dca_tp_close_pcts")]
    pub dca_tp_close_pcts: Vec<f64>,

    /// Trailing callback after all avg-based TPs fill.
    #[serde(default = "default_dca_trail_callback_pct")]
    pub dca_trail_callback_pct: f64,

    /// Buffer on the SL-to-avg move after the first avg-based TP (0 = exact
    /// avg).
    #[serde(default)]
    pub dca_be_buffer_pct: f64,

    /// Favorable move from avg that triggers the one-shot quick-trail.
    #[serde(default = "default_quick_trail_trigger_pct")]
    pub dca_quick_trail_trigger_pct: f64,

    /// SL distance from avg once the quick-trail triggers.
    #[serde(default = "default_quick_trail_buffer_pct")]
    pub dca_quick_trail_buffer_pct: f64,

    // --- Scale-in (pyramiding) -----------------------------------------------
    /// Place a scale-in limit at the TP2 fill price (only if no DCA filled).
    #[serde(default = "default_true")]
    pub scale_in_enabled: bool,

    // --- Zones ---------------------------------------------------------------
    #[serde(default = "default_true")]
    pub zone_snap_enabled: bool,

    /// Minimum distance from entry (percent) before a zone may claim a DCA
    /// level.
    #[serde(default = "default_zone_snap_min_pct")]
    pub zone_snap_min_pct: f64,

    /// Extra depth into the zone applied to the limit price, in percent.
    #[serde(default)]
    pub dca_limit_buffer_pct: f64,

    /// Minimum price shift (percent) before a resting DCA order is amended.
    #[serde(default = "default_min_resnap_pct")]
    pub min_resnap_pct: f64,

    #[serde(default = "default_zone_refresh_minutes")]
    pub zone_refresh_minutes: u64,

    #[serde(default = "default_zone_candle_interval")]
    pub zone_candle_interval: String,

    #[serde(default = "default_zone_candle_count")]
    pub zone_candle_count: u32,

    /// Zones older than this are invalid.
    #[serde(default = "default_zone_stale_minutes")]
    pub zone_stale_minutes: f64,

    /// Externally pushed zones younger than this suppress derived refreshes.
    #[serde(default = "default_external_zone_stale_minutes")]
    pub external_zone_stale_minutes: f64,

    // --- Admission filters ---------------------------------------------------
    /// Admit only signals aligned with the stored trend marker.
    #[serde(default = "default_true")]
    pub trend_filter_enabled: bool,

    /// Reject shorts already below S1 / longs already above R1.
    #[serde(default = "default_true")]
    pub zone_filter_enabled: bool,

    /// Skip signals whose stated leverage is below this.
    #[serde(default)]
    pub min_leverage_signal: u32,

    /// Skip signals whose stated leverage is above this.
    #[serde(default = "default_max_leverage_signal")]
    pub max_leverage_signal: u32,

    /// Base-coin allowlist (empty = all coins).
    #[serde(default)]
    pub allowed_coins: Vec<String>,

    /// Base-coin blocklist.
    #[serde(default)]
    pub blocked_coins: Vec<String>,

    /// Leverage assumed when a signal does not state one.
    #[serde(default = "default_fallback_signal_leverage")]
    pub fallback_signal_leverage: u32,
}

impl Default for BotConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes via defaults")
    }
}

impl BotConfig {
    /// Load configuration from a JSON file, then overlay credentials from the
    /// environment. A missing file yields pure defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config: Self = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config from {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env();

        info!(
            path = %path.display(),
            leverage = config.leverage,
            equity_pct = config.equity_pct_per_trade,
            max_trades = config.max_simultaneous_trades,
            testnet = config.bybit_testnet,
            "config loaded"
        );

        Ok(config)
    }

    /// Pull credentials and deployment overrides from environment variables.
    pub fn apply_env(&mut self) {
        let env = |key: &str| std::env::var(key).unwrap_or_default();

        self.bybit_api_key = env("BYBIT_API_KEY");
        self.bybit_api_secret = env("BYBIT_API_SECRET");
        self.telegram_bot_token = env("TELEGRAM_BOT_TOKEN");
        self.database_url = env("DATABASE_URL");

        if let Ok(v) = std::env::var("BYBIT_TESTNET") {
            self.bybit_testnet = v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
            self.telegram_chat_id = v;
        }
        if let Ok(v) = std::env::var("PORT") {
            if let Ok(p) = v.parse() {
                self.port = p;
            }
        }
        if let Ok(v) = std::env::var("LEVERAGE") {
            if let Ok(l) = v.parse() {
                self.leverage = l;
            }
        }
        if let Ok(v) = std::env::var("EQUITY_PCT") {
            if let Ok(p) = v.parse() {
                self.equity_pct_per_trade = p;
            }
        }
        if let Ok(v) = std::env::var("MAX_TRADES") {
            if let Ok(n) = v.parse() {
                self.max_simultaneous_trades = n;
            }
        }
    }

    // --- Sizing helpers ------------------------------------------------------

    /// Sum of DCA multipliers over the configured levels (E1 included).
    pub fn sum_multipliers(&self) -> f64 {
        self.dca_multipliers
            .iter()
            .take(self.max_dca_levels + 1)
            .sum()
    }

    /// Total margin budget for one trade at the given equity.
    pub fn trade_budget(&self, equity: f64) -> f64 {
        equity * self.equity_pct_per_trade / 100.0
    }

    /// Margin for a specific level (0 = E1).
    pub fn level_margin(&self, equity: f64, level: usize) -> f64 {
        let base = self.trade_budget(equity) / self.sum_multipliers();
        base * self.dca_multipliers[level]
    }

    /// Fixed-spacing trigger price for a level.
    pub fn level_price(&self, entry: f64, level: usize, side: Side) -> f64 {
        if level == 0 {
            return entry;
        }
        let pct = self.dca_spacing_pct[level] / 100.0;
        match side {
            Side::Long => entry * (1.0 - pct),
            Side::Short => entry * (1.0 + pct),
        }
    }

    /// Percentage of the position left to trail after all signal TPs.
    pub fn trail_remainder_pct(&self) -> f64 {
        100.0 - self.tp_close_pcts.iter().sum::<f64>()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.leverage, 20);
        assert_eq!(cfg.equity_pct_per_trade, 5.0);
        assert_eq!(cfg.max_simultaneous_trades, 6);
        assert_eq!(cfg.max_fills_per_batch, 3);
        assert_eq!(cfg.max_dca_levels, 1);
        assert_eq!(cfg.dca_multipliers, vec![1.0, 2.0]);
        assert_eq!(cfg.dca_spacing_pct, vec![0.0, 5.0]);
        assert_eq!(cfg.tp_close_pcts, vec![50.0, 10.0, 10.0, 10.0]);
        assert!(cfg.e1_limit_order);
        assert!(cfg.bybit_testnet);
        assert!(cfg.scale_in_enabled);
        assert!((cfg.trail_remainder_pct() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "leverage": 10, "max_simultaneous_trades": 2 }"#;
        let cfg: BotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.leverage, 10);
        assert_eq!(cfg.max_simultaneous_trades, 2);
        assert_eq!(cfg.equity_pct_per_trade, 5.0);
        assert_eq!(cfg.dca_tp_pcts, vec![0.5, 1.25]);
    }

    #[test]
    fn sizing_matches_budget_split() {
        // Equity 2400, 5% budget, multipliers [1, 2]: base margin = 40.
        let cfg = BotConfig::default();
        assert_eq!(cfg.sum_multipliers(), 3.0);
        assert!((cfg.trade_budget(2400.0) - 120.0).abs() < 1e-9);
        assert!((cfg.level_margin(2400.0, 0) - 40.0).abs() < 1e-9);
        assert!((cfg.level_margin(2400.0, 1) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn level_price_spacing() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.level_price(100.0, 0, Side::Long), 100.0);
        assert!((cfg.level_price(100.0, 1, Side::Long) - 95.0).abs() < 1e-9);
        assert!((cfg.level_price(100.0, 1, Side::Short) - 105.0).abs() < 1e-9);
    }

    #[test]
    fn credentials_never_serialized() {
        let mut cfg = BotConfig::default();
        cfg.bybit_api_key = "key".into();
        cfg.bybit_api_secret = "secret".into();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("bybit_api_key"));
    }
}
