// =============================================================================
// Signal Parser — free-text channel messages into structured signals
// =============================================================================
//
// Handles messages like:
//
//     🟢 Long
//     Name: AAVE/USDT
//     Margin mode: Cross (75.0X)
//
//     ⓒ Entry price(USDT):
//     113.14
//
//     Targets(USDT):
//     1) 114.27
//     2) 115.40
//     3) 116.53
//     4) 117.67
//     5) 🔝 unlimited
//
// Plus close commands ("Close AAVE/USDT") and TP-hit notifications
// ("💸 AAVE/USDT ✅ Target #1 Done ..."). Anything that does not parse is
// dropped silently; the channel delivers plenty of non-signals.
// =============================================================================

use tracing::{debug, warn};

use crate::types::Side;

/// A parsed trading signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub side: Side,
    /// Exchange form, e.g. "AAVEUSDT".
    pub symbol: String,
    /// Display form as received, e.g. "AAVE/USDT".
    pub symbol_display: String,
    pub entry_price: f64,
    pub targets: Vec<f64>,
    /// Leverage stated by the signal (recorded only; sizing uses our own).
    pub signal_leverage: u32,
}

/// A parsed close/cancel command.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSignal {
    pub symbol: String,
    pub symbol_display: String,
}

/// A parsed "Target #N Done" notification.
#[derive(Debug, Clone, PartialEq)]
pub struct TpHitSignal {
    pub symbol: String,
    pub symbol_display: String,
    pub tp_number: usize,
}

/// Normalize a display symbol ("1000BONK/USDT") to exchange form
/// ("1000BONKUSDT").
fn normalize_symbol(display: &str) -> String {
    display.trim().to_uppercase().replace('/', "")
}

/// First decimal number embedded in `s`, if any.
fn first_number(s: &str) -> Option<f64> {
    let bytes = s.as_bytes();
    let mut start = None;
    for (i, b) in bytes.iter().enumerate() {
        let is_num = b.is_ascii_digit() || *b == b'.';
        match (start, is_num) {
            (None, true) => start = Some(i),
            (Some(st), false) => {
                if let Ok(v) = s[st..i].parse::<f64>() {
                    return Some(v);
                }
                start = None;
            }
            _ => {}
        }
    }
    start.and_then(|st| s[st..].parse::<f64>().ok())
}

/// Parse a channel message into a [`Signal`]. Returns `None` if the message
/// is not a valid open signal.
pub fn parse_signal(message: &str, fallback_leverage: u32) -> Option<Signal> {
    let text = message.trim();
    if text.is_empty() {
        return None;
    }

    // ── Detect side ──
    let mut side = None;
    for line in text.lines() {
        let lower = line.trim().to_lowercase();
        if lower.contains('\u{1F534}') && lower.contains("short") || lower.ends_with("short") {
            side = Some(Side::Short);
            break;
        }
        if lower.contains('\u{1F7E2}') && lower.contains("long") || lower.ends_with("long") {
            side = Some(Side::Long);
            break;
        }
    }
    let side = side?;

    // ── Extract symbol ──
    let symbol_display = text.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Name:")?;
        rest.split_whitespace().next().map(|s| s.to_string())
    })?;
    let symbol = normalize_symbol(&symbol_display);

    // ── Extract leverage ("Cross (50.0X)") ──
    let signal_leverage = text
        .find("Cross (")
        .and_then(|pos| first_number(&text[pos + 7..]))
        .map(|v| v as u32)
        .unwrap_or(fallback_leverage);

    // ── Extract entry price (value follows the label, possibly next line) ──
    let mut entry_price = None;
    let mut lines = text.lines();
    for line in lines.by_ref() {
        if !line.to_lowercase().contains("entry price") {
            continue;
        }
        let after_colon = line.split_once(':').map(|(_, r)| r).unwrap_or("");
        entry_price = first_number(after_colon);
        break;
    }
    if entry_price.is_none() {
        // Value sits on the next non-empty line after the label.
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            entry_price = first_number(line);
            break;
        }
    }
    let entry_price = entry_price?;
    if entry_price <= 0.0 {
        return None;
    }

    // ── Extract numbered targets ("1) 114.27") ──
    let mut targets = Vec::new();
    let mut in_targets = false;
    for line in text.lines() {
        if !in_targets {
            in_targets = line.to_lowercase().contains("target");
            continue;
        }
        let Some((num, rest)) = line.trim().split_once(')') else {
            continue;
        };
        if num.trim().parse::<u32>().is_err() {
            continue;
        }
        // Skips "🔝 unlimited" style trailers.
        if let Some(price) = first_number(rest) {
            if price > 0.0 {
                targets.push(price);
            }
        }
    }

    if targets.is_empty() {
        warn!(symbol = %symbol_display, "no targets found in signal");
        return None;
    }

    // ── Validate the signal makes sense ──
    if side == Side::Long && targets[0] <= entry_price {
        warn!(symbol = %symbol_display, "long signal but TP1 <= entry");
        return None;
    }
    if side == Side::Short && targets[0] >= entry_price {
        warn!(symbol = %symbol_display, "short signal but TP1 >= entry");
        return None;
    }

    debug!(
        %side,
        symbol = %symbol_display,
        entry = entry_price,
        targets = ?targets,
        signal_leverage,
        "signal parsed"
    );

    Some(Signal {
        side,
        symbol,
        symbol_display,
        entry_price,
        targets,
        signal_leverage,
    })
}

/// Parse a close/cancel command ("Close 1000BONK/USDT", "Cancel ONDO/USDT").
pub fn parse_close_signal(message: &str) -> Option<CloseSignal> {
    let tokens: Vec<&str> = message.split_whitespace().collect();
    let pos = tokens.iter().position(|t| {
        t.eq_ignore_ascii_case("close")
            || t.eq_ignore_ascii_case("cancel")
            || t.eq_ignore_ascii_case("schliessen")
    })?;
    let symbol_display = tokens[pos + 1..]
        .iter()
        .find(|t| t.to_uppercase().contains("/USDT"))?
        .to_string();

    Some(CloseSignal {
        symbol: normalize_symbol(&symbol_display),
        symbol_display,
    })
}

/// Parse a TP-hit notification ("💸 MOODENG/USDT ✅ Target #1 Done ...").
pub fn parse_tp_hit(message: &str) -> Option<TpHitSignal> {
    let tokens: Vec<&str> = message.split_whitespace().collect();
    let tpos = tokens
        .iter()
        .position(|t| t.eq_ignore_ascii_case("target"))?;

    let tp_number = tokens
        .get(tpos + 1)?
        .trim_start_matches('#')
        .parse::<usize>()
        .ok()?;

    if !tokens
        .get(tpos + 2)
        .is_some_and(|t| t.eq_ignore_ascii_case("done"))
    {
        return None;
    }

    let symbol_display = tokens[..tpos]
        .iter()
        .rev()
        .find(|t| t.to_uppercase().contains("/USDT"))?
        .to_string();

    Some(TpHitSignal {
        symbol: normalize_symbol(&symbol_display),
        symbol_display,
        tp_number,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const SHORT_SIGNAL: &str = "\u{1F534} Short\n\
Name: 1000BONK/USDT\n\
Margin mode: Cross (50.0X)\n\
\n\
\u{24D2} Entry price(USDT):\n\
0.0063220\n\
\n\
Targets(USDT):\n\
1) 0.0062590\n\
2) 0.0061960\n\
3) 0.0061320\n\
4) 0.0060690\n\
5) \u{1F51D} unlimited";

    const LONG_SIGNAL: &str = "\u{1F7E2} Long\n\
Name: AAVE/USDT\n\
Margin mode: Cross (75.0X)\n\
\n\
\u{24D2} Entry price(USDT):\n\
113.14\n\
\n\
Targets(USDT):\n\
1) 114.27\n\
2) 115.40\n\
3) 116.53\n\
4) 117.67\n\
5) \u{1F51D} unlimited";

    #[test]
    fn parses_short_signal() {
        let sig = parse_signal(SHORT_SIGNAL, 50).unwrap();
        assert_eq!(sig.side, Side::Short);
        assert_eq!(sig.symbol, "1000BONKUSDT");
        assert_eq!(sig.symbol_display, "1000BONK/USDT");
        assert!((sig.entry_price - 0.0063220).abs() < 1e-12);
        assert_eq!(sig.targets.len(), 4);
        assert!((sig.targets[0] - 0.0062590).abs() < 1e-12);
        assert_eq!(sig.signal_leverage, 50);
    }

    #[test]
    fn parses_long_signal() {
        let sig = parse_signal(LONG_SIGNAL, 50).unwrap();
        assert_eq!(sig.side, Side::Long);
        assert_eq!(sig.symbol, "AAVEUSDT");
        assert!((sig.entry_price - 113.14).abs() < 1e-9);
        assert_eq!(
            sig.targets,
            vec![114.27, 115.40, 116.53, 117.67]
        );
        assert_eq!(sig.signal_leverage, 75);
    }

    #[test]
    fn missing_leverage_uses_fallback() {
        let msg = LONG_SIGNAL.replace("Margin mode: Cross (75.0X)", "Margin mode: Cross");
        let sig = parse_signal(&msg, 25).unwrap();
        assert_eq!(sig.signal_leverage, 25);
    }

    #[test]
    fn rejects_non_signals() {
        assert!(parse_signal("Hello world, this is not a signal", 50).is_none());
        assert!(parse_signal("", 50).is_none());
    }

    #[test]
    fn rejects_nonsense_targets() {
        // Long whose first target is below entry.
        let msg = LONG_SIGNAL.replace("1) 114.27", "1) 100.00");
        assert!(parse_signal(&msg, 50).is_none());

        // Short whose first target is above entry.
        let msg = SHORT_SIGNAL.replace("1) 0.0062590", "1) 0.0070000");
        assert!(parse_signal(&msg, 50).is_none());
    }

    #[test]
    fn rejects_signal_without_targets() {
        let msg = "\u{1F7E2} Long\nName: XMR/USDT\nEntry price(USDT):\n326.26\n";
        assert!(parse_signal(msg, 50).is_none());
    }

    #[test]
    fn parses_close_signal() {
        let close = parse_close_signal("Close 1000BONK/USDT").unwrap();
        assert_eq!(close.symbol, "1000BONKUSDT");
        let cancel = parse_close_signal("Cancel ONDO/USDT now please").unwrap();
        assert_eq!(cancel.symbol, "ONDOUSDT");
        assert!(parse_close_signal("nothing to see").is_none());
    }

    #[test]
    fn parses_tp_hit() {
        let hit = parse_tp_hit(
            "\u{1F4B8} MOODENG/USDT \u{2705} Target #1 Done Current profit: 50.0%",
        )
        .unwrap();
        assert_eq!(hit.symbol, "MOODENGUSDT");
        assert_eq!(hit.tp_number, 1);

        let hit = parse_tp_hit("\u{1F4B8} BTC/USDT \u{2705} Target #2 Done").unwrap();
        assert_eq!(hit.tp_number, 2);

        assert!(parse_tp_hit("BTC/USDT Target #2 pending").is_none());
        assert!(parse_tp_hit("Target #2 Done").is_none());
    }
}
