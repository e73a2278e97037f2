// =============================================================================
// Bybit exchange client — module root
// =============================================================================

pub mod client;
pub mod models;

pub use client::BybitClient;

use crate::types::Side;

/// Failure kinds the core branches on. Everything else surfaces as `Api` or
/// `Transport` and is retried on the next loop tick.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("invalid quantity")]
    InvalidQty,
    #[error("invalid price")]
    InvalidPrice,
    #[error("rate limited")]
    RateLimit,
    #[error("order not found")]
    NotFound,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("api error {code}: {msg}")]
    Api { code: i64, msg: String },
}

impl ExchangeError {
    /// Classify a non-zero Bybit retCode into the taxonomy above.
    pub fn from_ret_code(code: i64, msg: &str) -> Self {
        let lower = msg.to_ascii_lowercase();
        match code {
            10006 | 10018 => Self::RateLimit,
            110001 => Self::NotFound,
            110007 | 110012 | 110052 => Self::InsufficientMargin,
            110003 | 110094 => Self::InvalidPrice,
            _ if lower.contains("qty") => Self::InvalidQty,
            _ if lower.contains("price") => Self::InvalidPrice,
            _ => Self::Api {
                code,
                msg: msg.to_string(),
            },
        }
    }

    /// Transient errors are retried by the calling loop on its next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Transport(_))
    }
}

// =============================================================================
// Rounding policy
// =============================================================================
//
// Quantities always round DOWN to the lot step (never order more than sized).
// Limit prices round toward the favorable side: down for longs, up for
// shorts, so a rounded limit never crosses the intended level.

/// Decimal places implied by a step/tick size ("0.001" -> 3). Handles steps
/// that format in scientific notation.
pub fn step_precision(step: f64) -> usize {
    if step <= 0.0 {
        return 0;
    }
    let s = format!("{step:.10}");
    let trimmed = s.trim_end_matches('0');
    match trimmed.split_once('.') {
        Some((_, frac)) => frac.len(),
        None => 0,
    }
}

/// Round a quantity down to the instrument's lot step.
pub fn round_qty(qty: f64, qty_step: f64) -> f64 {
    if qty_step <= 0.0 {
        return qty;
    }
    let steps = (qty / qty_step + 1e-9).floor();
    let rounded = steps * qty_step;
    let precision = step_precision(qty_step);
    round_dp(rounded, precision)
}

/// Round a limit price to the tick grid: down for longs, up for shorts.
pub fn round_limit_price(price: f64, tick_size: f64, side: Side) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    let ticks = price / tick_size;
    let snapped = match side {
        Side::Long => (ticks + 1e-9).floor(),
        Side::Short => (ticks - 1e-9).ceil(),
    };
    round_dp(snapped * tick_size, step_precision(tick_size))
}

/// Round a stop/conditional price down to the tick grid regardless of side.
pub fn round_price_down(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    round_dp(
        (price / tick_size + 1e-9).floor() * tick_size,
        step_precision(tick_size),
    )
}

fn round_dp(value: f64, dp: usize) -> f64 {
    let factor = 10f64.powi(dp as i32);
    (value * factor).round() / factor
}

/// Format a value with exactly the precision its step implies, for the wire.
pub fn format_step(value: f64, step: f64) -> String {
    format!("{:.*}", step_precision(step), value)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_from_steps() {
        assert_eq!(step_precision(0.001), 3);
        assert_eq!(step_precision(0.01), 2);
        assert_eq!(step_precision(1.0), 0);
        assert_eq!(step_precision(0.00001), 5);
        assert_eq!(step_precision(0.0), 0);
    }

    #[test]
    fn qty_rounds_down_to_step() {
        assert_eq!(round_qty(8.059, 0.01), 8.05);
        assert_eq!(round_qty(8.0, 0.01), 8.0);
        assert_eq!(round_qty(0.009, 0.01), 0.0);
        // Float representation noise must not drop a whole step.
        assert_eq!(round_qty(0.29999999999999993, 0.1), 0.3);
        assert_eq!(round_qty(2.3, 0.1), 2.3);
    }

    #[test]
    fn limit_price_rounds_toward_favorable_side() {
        assert_eq!(round_limit_price(100.0567, 0.01, Side::Long), 100.05);
        assert_eq!(round_limit_price(100.0512, 0.01, Side::Short), 100.06);
        // Already on-grid prices stay put for both sides.
        assert_eq!(round_limit_price(100.05, 0.01, Side::Long), 100.05);
        assert_eq!(round_limit_price(100.05, 0.01, Side::Short), 100.05);
    }

    #[test]
    fn stop_price_rounds_down() {
        assert_eq!(round_price_down(92.1567, 0.01), 92.15);
        assert_eq!(round_price_down(92.15, 0.01), 92.15);
    }

    #[test]
    fn wire_format_uses_step_precision() {
        assert_eq!(format_step(8.0, 0.01), "8.00");
        assert_eq!(format_step(0.00632, 0.00001), "0.00632");
        assert_eq!(format_step(105.0, 1.0), "105");
    }

    #[test]
    fn ret_code_classification() {
        assert!(matches!(
            ExchangeError::from_ret_code(10006, "too many visits"),
            ExchangeError::RateLimit
        ));
        assert!(matches!(
            ExchangeError::from_ret_code(110007, "ab not enough"),
            ExchangeError::InsufficientMargin
        ));
        assert!(matches!(
            ExchangeError::from_ret_code(110001, "order not exists"),
            ExchangeError::NotFound
        ));
        assert!(matches!(
            ExchangeError::from_ret_code(10001, "Qty invalid"),
            ExchangeError::InvalidQty
        ));
        assert!(matches!(
            ExchangeError::from_ret_code(99999, "mystery"),
            ExchangeError::Api { code: 99999, .. }
        ));
        assert!(ExchangeError::RateLimit.is_transient());
        assert!(!ExchangeError::InvalidQty.is_transient());
    }
}
