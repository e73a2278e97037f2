// =============================================================================
// Shared types used across the Helios trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Current wall-clock time as fractional unix seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts. PnL = sign * (exit - entry) * qty.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// Order side string for opening this position on the exchange.
    pub fn open_order_side(&self) -> &'static str {
        match self {
            Self::Long => "Buy",
            Self::Short => "Sell",
        }
    }

    /// Order side string for reducing/closing this position.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Self::Long => "Sell",
            Self::Short => "Buy",
        }
    }

    pub fn from_exchange(s: &str) -> Option<Self> {
        match s {
            "Buy" => Some(Self::Long),
            "Sell" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Durable per-symbol trend marker set by trend-switch events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
}

impl TrendDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }

    /// The position side this trend supports.
    pub fn aligned_side(&self) -> Side {
        match self {
            Self::Up => Side::Long,
            Self::Down => Side::Short,
        }
    }

    /// The position side a switch to this trend closes out.
    pub fn opposing_side(&self) -> Side {
        match self {
            Self::Up => Side::Short,
            Self::Down => Side::Long,
        }
    }
}

impl std::fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

// =============================================================================
// Order link IDs
// =============================================================================
//
// Every order we place carries a client-assigned link id of the form
// `{trade_id}_{tag}`. Reconciliation can then identify an order without
// cross-referencing exchange-assigned ids.

/// Role of an order within a trade, encoded in its link id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderTag {
    /// Primary entry (DCA index 0).
    Entry,
    /// Averaging entry at slot k (k >= 1).
    Dca(usize),
    /// Signal-target take profit leg k (1-based).
    Tp(usize),
    /// Avg-based take profit leg k after a DCA fill (1-based).
    DcaTp(usize),
    /// Re-placed take profit leg k after a scale-in (1-based).
    ScaleTp(usize),
    /// Scale-in (pyramid) entry.
    ScaleIn,
    /// Reduce-only market close.
    Close,
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "E1"),
            Self::Dca(k) => write!(f, "DCA{k}"),
            Self::Tp(k) => write!(f, "TP{k}"),
            Self::DcaTp(k) => write!(f, "DTP{k}"),
            Self::ScaleTp(k) => write!(f, "STP{k}"),
            Self::ScaleIn => write!(f, "SI"),
            Self::Close => write!(f, "CLOSE"),
        }
    }
}

impl OrderTag {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "E1" => return Some(Self::Entry),
            "SI" => return Some(Self::ScaleIn),
            "CLOSE" => return Some(Self::Close),
            _ => {}
        }
        for (prefix, build) in [
            ("DCA", Self::Dca as fn(usize) -> Self),
            ("DTP", Self::DcaTp),
            ("STP", Self::ScaleTp),
            ("TP", Self::Tp),
        ] {
            if let Some(num) = s.strip_prefix(prefix) {
                if let Ok(k) = num.parse::<usize>() {
                    return Some(build(k));
                }
            }
        }
        None
    }
}

/// Build the client order link id for an order belonging to `trade_id`.
pub fn build_link_id(trade_id: &str, tag: OrderTag) -> String {
    format!("{trade_id}_{tag}")
}

/// Split a link id back into `(trade_id, tag)`. Returns `None` for ids we
/// did not assign.
pub fn parse_link_id(link_id: &str) -> Option<(&str, OrderTag)> {
    let (trade_id, tag_str) = link_id.rsplit_once('_')?;
    let tag = OrderTag::parse(tag_str)?;
    Some((trade_id, tag))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_signs_and_order_sides() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.open_order_side(), "Buy");
        assert_eq!(Side::Long.close_order_side(), "Sell");
        assert_eq!(Side::Short.open_order_side(), "Sell");
        assert_eq!(Side::Short.close_order_side(), "Buy");
        assert_eq!(Side::from_exchange("Buy"), Some(Side::Long));
        assert_eq!(Side::from_exchange("Sell"), Some(Side::Short));
        assert_eq!(Side::from_exchange("None"), None);
    }

    #[test]
    fn trend_direction_sides() {
        assert_eq!(TrendDirection::Up.aligned_side(), Side::Long);
        assert_eq!(TrendDirection::Up.opposing_side(), Side::Short);
        assert_eq!(TrendDirection::parse("DOWN"), Some(TrendDirection::Down));
        assert_eq!(TrendDirection::parse("sideways"), None);
    }

    #[test]
    fn link_id_roundtrip() {
        let cases = [
            OrderTag::Entry,
            OrderTag::Dca(2),
            OrderTag::Tp(4),
            OrderTag::DcaTp(1),
            OrderTag::ScaleTp(3),
            OrderTag::ScaleIn,
            OrderTag::Close,
        ];
        for tag in cases {
            let id = build_link_id("FOOUSDT_1712000000_7", tag);
            let (trade_id, parsed) = parse_link_id(&id).unwrap();
            assert_eq!(trade_id, "FOOUSDT_1712000000_7");
            assert_eq!(parsed, tag);
        }
    }

    #[test]
    fn link_id_rejects_foreign_ids() {
        assert!(parse_link_id("not-ours").is_none());
        assert!(parse_link_id("trade_XX9").is_none());
        // Trade ids themselves contain underscores; only the last segment is
        // the tag.
        let (trade_id, tag) = parse_link_id("A_B_C_TP2").unwrap();
        assert_eq!(trade_id, "A_B_C");
        assert_eq!(tag, OrderTag::Tp(2));
    }

    #[test]
    fn side_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Long).unwrap(), "\"long\"");
        let s: Side = serde_json::from_str("\"short\"").unwrap();
        assert_eq!(s, Side::Short);
    }
}
