// =============================================================================
// Bybit v5 response models — typed records over the JSON envelope
// =============================================================================
//
// Bybit serializes every numeric field as a string ("" when unset). The
// deserializers here accept string, number, or empty and are applied field by
// field so that a malformed payload fails with a precise serde error while
// unknown fields pass through untouched.
// =============================================================================

use serde::{Deserialize, Deserializer, Serialize};

use crate::types::Side;

/// Deserialize a Bybit numeric field that may arrive as a string, a number,
/// an empty string, or null.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(0.0),
        serde_json::Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Ok(0.0)
            } else {
                s.parse::<f64>().map_err(serde::de::Error::custom)
            }
        }
        other => Err(serde::de::Error::custom(format!(
            "expected number or string, got {other}"
        ))),
    }
}

fn default_f64() -> f64 {
    0.0
}

// =============================================================================
// Envelope
// =============================================================================

/// Top-level Bybit v5 response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEnvelope {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Generic `result.list` wrapper.
#[derive(Debug, Clone)]
pub struct ListResult<T> {
    pub list: Vec<T>,
}

impl<'de, T> Deserialize<'de> for ListResult<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Helper<T> {
            #[serde(default = "Vec::new")]
            list: Vec<T>,
        }
        let helper = Helper::<T>::deserialize(deserializer)?;
        Ok(ListResult { list: helper.list })
    }
}

// =============================================================================
// Market data
// =============================================================================

/// Best bid/ask plus the mark price used for stop evaluation.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    #[serde(rename = "bid1Price", deserialize_with = "lenient_f64", default = "default_f64")]
    pub bid: f64,
    #[serde(rename = "ask1Price", deserialize_with = "lenient_f64", default = "default_f64")]
    pub ask: f64,
    #[serde(rename = "markPrice", deserialize_with = "lenient_f64", default = "default_f64")]
    pub mark: f64,
}

/// One OHLC bar. Bybit returns klines newest first; the client reverses them
/// so consumers always see oldest -> newest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar start time, unix milliseconds.
    pub start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// =============================================================================
// Instruments
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    min_order_qty: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    max_order_qty: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    qty_step: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    tick_size: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    min_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstrument {
    pub symbol: String,
    lot_size_filter: LotSizeFilter,
    price_filter: PriceFilter,
}

/// Static per-symbol trading rules; cacheable for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentInfo {
    pub min_qty: f64,
    pub max_qty: f64,
    pub qty_step: f64,
    pub tick_size: f64,
    pub min_price: f64,
}

impl From<RawInstrument> for InstrumentInfo {
    fn from(raw: RawInstrument) -> Self {
        Self {
            min_qty: raw.lot_size_filter.min_order_qty,
            max_qty: raw.lot_size_filter.max_order_qty,
            qty_step: raw.lot_size_filter.qty_step,
            tick_size: raw.price_filter.tick_size,
            min_price: raw.price_filter.min_price,
        }
    }
}

// =============================================================================
// Orders
// =============================================================================

/// Normalized order state across the realtime and history endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// Bybit's `orderStatus` strings collapsed to the five states the core
    /// branches on. Unknown strings are treated as still-open so that no fill
    /// action is taken on a state we do not understand.
    pub fn parse(s: &str) -> Self {
        match s {
            "Filled" => Self::Filled,
            "PartiallyFilled" => Self::PartiallyFilled,
            "Cancelled" | "Deactivated" | "PartiallyFilledCanceled" => Self::Cancelled,
            "Rejected" => Self::Rejected,
            _ => Self::Open,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrder {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    #[serde(default)]
    pub order_status: String,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub cum_exec_qty: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub avg_price: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub price: f64,
    #[serde(default)]
    pub side: String,
}

/// Order status as seen by the core.
#[derive(Debug, Clone, Copy)]
pub struct OrderStatus {
    pub state: OrderState,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
}

impl From<&RawOrder> for OrderStatus {
    fn from(raw: &RawOrder) -> Self {
        Self {
            state: OrderState::parse(&raw.order_status),
            filled_qty: raw.cum_exec_qty,
            avg_fill_price: raw.avg_price,
        }
    }
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub size: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub avg_price: f64,
    #[serde(rename = "stopLoss", deserialize_with = "lenient_f64", default = "default_f64")]
    pub stop_loss: f64,
    #[serde(rename = "trailingStop", deserialize_with = "lenient_f64", default = "default_f64")]
    pub trailing_stop: f64,
    #[serde(rename = "unrealisedPnl", deserialize_with = "lenient_f64", default = "default_f64")]
    pub unrealized_pnl: f64,
}

/// A live position on the exchange.
#[derive(Debug, Clone)]
pub struct PositionInfo {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub avg_price: f64,
    pub stop_loss: f64,
    pub trailing_stop: f64,
    pub unrealized_pnl: f64,
}

impl PositionInfo {
    pub fn from_raw(raw: &RawPosition) -> Option<Self> {
        if raw.size <= 0.0 {
            return None;
        }
        Some(Self {
            symbol: raw.symbol.clone(),
            side: Side::from_exchange(&raw.side)?,
            qty: raw.size,
            avg_price: raw.avg_price,
            stop_loss: raw.stop_loss,
            trailing_stop: raw.trailing_stop,
            unrealized_pnl: raw.unrealized_pnl,
        })
    }
}

// =============================================================================
// Closed PnL
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawClosedPnl {
    #[serde(default)]
    pub symbol: String,
    /// Side of the *closing* execution; a Sell execution closes a long.
    #[serde(default)]
    pub side: String,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub qty: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub avg_entry_price: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub avg_exit_price: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub closed_pnl: f64,
    #[serde(default)]
    pub order_type: String,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub created_time: f64,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub updated_time: f64,
}

/// The authoritative post-close ledger record. `realized_pnl` is net of fees.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPnlRecord {
    pub symbol: String,
    /// Side of the position that closed (inverted from the closing order).
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub order_type: String,
    /// Unix seconds.
    pub created_at: f64,
    pub updated_at: f64,
}

impl ClosedPnlRecord {
    pub fn from_raw(raw: &RawClosedPnl) -> Option<Self> {
        // Sell closes a long, Buy closes a short.
        let side = match Side::from_exchange(&raw.side)? {
            Side::Short => Side::Long,
            Side::Long => Side::Short,
        };
        Some(Self {
            symbol: raw.symbol.clone(),
            side,
            qty: raw.qty,
            entry_price: raw.avg_entry_price,
            exit_price: raw.avg_exit_price,
            realized_pnl: raw.closed_pnl,
            order_type: raw.order_type.clone(),
            created_at: raw.created_time / 1000.0,
            updated_at: raw.updated_time / 1000.0,
        })
    }
}

// =============================================================================
// Wallet
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWalletCoin {
    #[serde(default)]
    pub coin: String,
    #[serde(deserialize_with = "lenient_f64", default = "default_f64")]
    pub equity: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWalletAccount {
    #[serde(default)]
    pub coin: Vec<RawWalletCoin>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_f64_accepts_strings_numbers_and_empty() {
        #[derive(Deserialize)]
        struct T {
            #[serde(deserialize_with = "lenient_f64")]
            v: f64,
        }
        let t: T = serde_json::from_str(r#"{"v": "1.25"}"#).unwrap();
        assert_eq!(t.v, 1.25);
        let t: T = serde_json::from_str(r#"{"v": 2.5}"#).unwrap();
        assert_eq!(t.v, 2.5);
        let t: T = serde_json::from_str(r#"{"v": ""}"#).unwrap();
        assert_eq!(t.v, 0.0);
        let t: T = serde_json::from_str(r#"{"v": null}"#).unwrap();
        assert_eq!(t.v, 0.0);
        assert!(serde_json::from_str::<T>(r#"{"v": "abc"}"#).is_err());
    }

    #[test]
    fn ticker_parses_bybit_shape() {
        let json = r#"{
            "symbol": "FOOUSDT",
            "bid1Price": "99.95",
            "ask1Price": "100.05",
            "markPrice": "100.00",
            "lastPrice": "100.01"
        }"#;
        let t: Ticker = serde_json::from_str(json).unwrap();
        assert_eq!(t.bid, 99.95);
        assert_eq!(t.ask, 100.05);
        assert_eq!(t.mark, 100.0);
    }

    #[test]
    fn instrument_flattens_filters() {
        let json = r#"{
            "symbol": "FOOUSDT",
            "lotSizeFilter": {"minOrderQty": "0.01", "maxOrderQty": "10000", "qtyStep": "0.01"},
            "priceFilter": {"tickSize": "0.001", "minPrice": "0.001"},
            "contractType": "LinearPerpetual"
        }"#;
        let raw: RawInstrument = serde_json::from_str(json).unwrap();
        let info: InstrumentInfo = raw.into();
        assert_eq!(info.min_qty, 0.01);
        assert_eq!(info.qty_step, 0.01);
        assert_eq!(info.tick_size, 0.001);
    }

    #[test]
    fn order_state_mapping() {
        assert_eq!(OrderState::parse("New"), OrderState::Open);
        assert_eq!(OrderState::parse("Untriggered"), OrderState::Open);
        assert_eq!(OrderState::parse("PartiallyFilled"), OrderState::PartiallyFilled);
        assert_eq!(OrderState::parse("Filled"), OrderState::Filled);
        assert_eq!(OrderState::parse("Cancelled"), OrderState::Cancelled);
        assert_eq!(OrderState::parse("Deactivated"), OrderState::Cancelled);
        assert_eq!(OrderState::parse("Rejected"), OrderState::Rejected);
        assert_eq!(OrderState::parse("SomethingNew"), OrderState::Open);
    }

    #[test]
    fn position_skips_empty_entries() {
        let raw: RawPosition = serde_json::from_str(
            r#"{"symbol": "FOOUSDT", "side": "None", "size": "0", "avgPrice": "0"}"#,
        )
        .unwrap();
        assert!(PositionInfo::from_raw(&raw).is_none());

        let raw: RawPosition = serde_json::from_str(
            r#"{
                "symbol": "FOOUSDT",
                "side": "Buy",
                "size": "8",
                "avgPrice": "100",
                "stopLoss": "",
                "trailingStop": "",
                "unrealisedPnl": "1.5"
            }"#,
        )
        .unwrap();
        let pos = PositionInfo::from_raw(&raw).unwrap();
        assert_eq!(pos.side, Side::Long);
        assert_eq!(pos.qty, 8.0);
        assert_eq!(pos.stop_loss, 0.0);
    }

    #[test]
    fn closed_pnl_inverts_closing_side_and_converts_time() {
        let raw: RawClosedPnl = serde_json::from_str(
            r#"{
                "symbol": "FOOUSDT",
                "side": "Sell",
                "qty": "1.6",
                "avgEntryPrice": "100",
                "avgExitPrice": "103.95",
                "closedPnl": "6.21",
                "orderType": "Market",
                "createdTime": "1712000000000",
                "updatedTime": "1712000001000"
            }"#,
        )
        .unwrap();
        let rec = ClosedPnlRecord::from_raw(&raw).unwrap();
        // A Sell execution closed a long position.
        assert_eq!(rec.side, Side::Long);
        assert_eq!(rec.created_at, 1_712_000_000.0);
        assert_eq!(rec.updated_at, 1_712_000_001.0);
        assert!((rec.realized_pnl - 6.21).abs() < 1e-9);
    }

    #[test]
    fn envelope_tolerates_unknown_fields() {
        let env: ApiEnvelope = serde_json::from_str(
            r#"{"retCode": 0, "retMsg": "OK", "result": {"list": []}, "retExtInfo": {}, "time": 1}"#,
        )
        .unwrap();
        assert_eq!(env.ret_code, 0);
    }
}
