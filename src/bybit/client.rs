// =============================================================================
// Bybit v5 REST client — HMAC-SHA256 signed requests, linear perpetuals
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry a recvWindow of 5 000 ms to tolerate minor clock drift between the
// bot and the exchange.
//
// The client is stateless apart from two caches: the detected position mode
// (one-way vs hedge) and per-symbol instrument rules. It owns no trade state.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::models::{
    ApiEnvelope, Candle, ClosedPnlRecord, InstrumentInfo, ListResult, OrderStatus, PositionInfo,
    RawClosedPnl, RawInstrument, RawOrder, RawPosition, RawWalletAccount,
};
use super::{format_step, round_limit_price, round_price_down, round_qty, ExchangeError};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

/// recvWindow sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Kind of order to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
}

impl OrderKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "Market",
            Self::Limit => "Limit",
        }
    }
}

#[derive(Default)]
struct PositionMode {
    hedge: bool,
    detected: bool,
    initialized_symbols: HashSet<String>,
}

/// Bybit v5 REST client for USDT linear perpetuals.
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    mode: RwLock<PositionMode>,
    instruments: RwLock<HashMap<String, InstrumentInfo>>,
}

impl BybitClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let base_url = if testnet {
            "https://api-testnet.bybit.com".to_string()
        } else {
            "https://api.bybit.com".to_string()
        };

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(%base_url, "BybitClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url,
            http,
            mode: RwLock::new(PositionMode::default()),
            instruments: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`.
    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get_signed(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let ts = Self::timestamp_ms();
        let sig = self.sign(ts, query);
        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let resp = self
            .http
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .send()
            .await?;

        Self::unwrap_envelope(resp).await
    }

    async fn get_public(&self, path: &str, query: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}{path}?{query}", self.base_url);
        let resp = self.http.get(&url).send().await?;
        Self::unwrap_envelope(resp).await
    }

    async fn post_signed(&self, path: &str, body: &Value) -> Result<Value, ExchangeError> {
        let ts = Self::timestamp_ms();
        let payload = body.to_string();
        let sig = self.sign(ts, &payload);
        let url = format!("{}{path}", self.base_url);

        let resp = self
            .http
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await?;

        Self::unwrap_envelope(resp).await
    }

    /// Parse the v5 envelope; a non-zero retCode becomes a typed error.
    async fn unwrap_envelope(resp: reqwest::Response) -> Result<Value, ExchangeError> {
        let status = resp.status();
        let text = resp.text().await?;

        let env: ApiEnvelope = serde_json::from_str(&text).map_err(|e| {
            ExchangeError::BadResponse(format!("http {status}: {e}: {}", truncate(&text, 200)))
        })?;

        if env.ret_code != 0 {
            return Err(ExchangeError::from_ret_code(env.ret_code, &env.ret_msg));
        }
        Ok(env.result)
    }

    fn parse_list<T: serde::de::DeserializeOwned>(result: Value) -> Result<Vec<T>, ExchangeError> {
        let list: ListResult<T> = serde_json::from_value(result)
            .map_err(|e| ExchangeError::BadResponse(format!("unexpected list shape: {e}")))?;
        Ok(list.list)
    }

    // -------------------------------------------------------------------------
    // Position mode
    // -------------------------------------------------------------------------

    /// In hedge mode the positions endpoint returns two entries per symbol
    /// (Buy side + Sell side); one-way returns a single entry. Detected once
    /// at first symbol setup.
    async fn detect_position_mode(&self, symbol: &str) {
        let query = format!("category=linear&symbol={symbol}");
        match self.get_signed("/v5/position/list", &query).await {
            Ok(result) => {
                let entries = result
                    .get("list")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                let hedge = entries >= 2;
                let mut mode = self.mode.write();
                mode.hedge = hedge;
                mode.detected = true;
                info!(
                    mode = if hedge { "hedge" } else { "one-way" },
                    "position mode detected"
                );
            }
            Err(e) => {
                warn!(error = %e, "could not detect position mode, assuming one-way");
                self.mode.write().detected = true;
            }
        }
    }

    /// positionIdx for order calls: hedge mode long=1 short=2, one-way omits
    /// the parameter.
    fn position_idx(&self, side: Side) -> Option<u8> {
        if !self.mode.read().hedge {
            return None;
        }
        Some(match side {
            Side::Long => 1,
            Side::Short => 2,
        })
    }

    /// Set cross margin and leverage for a symbol before first use.
    /// "Not modified" responses are success.
    pub async fn setup_symbol(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let (initialized, detected) = {
            let mode = self.mode.read();
            (mode.initialized_symbols.contains(symbol), mode.detected)
        };
        if initialized {
            return Ok(());
        }
        if !detected {
            self.detect_position_mode(symbol).await;
        }

        let margin_body = json!({
            "category": "linear",
            "symbol": symbol,
            "tradeMode": 0,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        if let Err(e) = self.post_signed("/v5/position/switch-isolated", &margin_body).await {
            if !is_not_modified(&e) {
                debug!(symbol, error = %e, "margin mode switch skipped");
            }
        }

        let lev_body = json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        if let Err(e) = self.post_signed("/v5/position/set-leverage", &lev_body).await {
            if !is_not_modified(&e) {
                return Err(e);
            }
        }

        self.mode.write().initialized_symbols.insert(symbol.to_string());
        info!(symbol, leverage, "symbol setup: cross margin");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// Current USDT equity of the unified account.
    pub async fn get_equity(&self) -> Result<f64, ExchangeError> {
        let result = self
            .get_signed(
                "/v5/account/wallet-balance",
                "accountType=UNIFIED&coin=USDT",
            )
            .await?;
        let accounts: Vec<RawWalletAccount> = Self::parse_list(result)?;
        let equity = accounts
            .first()
            .and_then(|a| a.coin.iter().find(|c| c.coin == "USDT"))
            .map(|c| c.equity)
            .unwrap_or(0.0);
        Ok(equity)
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Quote for a symbol: best bid/ask plus mark price. No side effects.
    pub async fn ticker(&self, symbol: &str) -> Result<super::models::Ticker, ExchangeError> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.get_public("/v5/market/tickers", &query).await?;
        let mut list: Vec<super::models::Ticker> = Self::parse_list(result)?;
        list.pop()
            .ok_or_else(|| ExchangeError::BadResponse(format!("no ticker for {symbol}")))
    }

    /// Mark price convenience wrapper; `None` when the quote fails.
    pub async fn mark_price(&self, symbol: &str) -> Option<f64> {
        match self.ticker(symbol).await {
            Ok(t) if t.mark > 0.0 => Some(t.mark),
            Ok(_) => None,
            Err(e) => {
                warn!(symbol, error = %e, "failed to fetch mark price");
                None
            }
        }
    }

    /// Trading rules for a symbol, cached for the process lifetime.
    pub async fn instrument(&self, symbol: &str) -> Result<InstrumentInfo, ExchangeError> {
        if let Some(info) = self.instruments.read().get(symbol) {
            return Ok(*info);
        }

        let query = format!("category=linear&symbol={symbol}");
        let result = self.get_public("/v5/market/instruments-info", &query).await?;
        let mut list: Vec<RawInstrument> = Self::parse_list(result)?;
        let raw = list
            .pop()
            .ok_or_else(|| ExchangeError::BadResponse(format!("unknown instrument {symbol}")))?;
        let info: InstrumentInfo = raw.into();
        self.instruments.write().insert(symbol.to_string(), info);
        Ok(info)
    }

    /// OHLC candles, returned oldest -> newest.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let query = format!("category=linear&symbol={symbol}&interval={interval}&limit={limit}");
        let result = self.get_public("/v5/market/kline", &query).await?;

        let rows = result
            .get("list")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::BadResponse("kline response missing list".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        // Bybit returns newest first; reverse to oldest -> newest.
        for row in rows.iter().rev() {
            let cols = row
                .as_array()
                .ok_or_else(|| ExchangeError::BadResponse("kline row is not an array".into()))?;
            if cols.len() < 6 {
                warn!(len = cols.len(), "skipping malformed kline row");
                continue;
            }
            let f = |i: usize| -> f64 {
                cols[i]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| cols[i].as_f64())
                    .unwrap_or(0.0)
            };
            candles.push(Candle {
                start: f(0) as i64,
                open: f(1),
                high: f(2),
                low: f(3),
                close: f(4),
                volume: f(5),
            });
        }
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Place an order. `side` is the ORDER direction (the position side for
    /// entries, its opposite for reduce-only exits). Quantities round down to
    /// the lot step; limit prices round down for Buy orders and up for Sell
    /// orders so the rounded price never crosses the intended level.
    ///
    /// Returns the exchange order id.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        symbol: &str,
        position_side: Side,
        order_side: &str,
        kind: OrderKind,
        qty: f64,
        price: Option<f64>,
        reduce_only: bool,
        link_id: &str,
    ) -> Result<String, ExchangeError> {
        let info = self.instrument(symbol).await?;

        let qty = round_qty(qty, info.qty_step);
        if qty < info.min_qty {
            return Err(ExchangeError::InvalidQty);
        }

        let mut body = json!({
            "category": "linear",
            "symbol": symbol,
            "side": order_side,
            "orderType": kind.as_str(),
            "qty": format_step(qty, info.qty_step),
            "timeInForce": "GTC",
            "orderLinkId": link_id,
        });

        if let Some(raw_price) = price {
            let round_side = if order_side == "Buy" { Side::Long } else { Side::Short };
            let price = round_limit_price(raw_price, info.tick_size, round_side);
            if price <= 0.0 || price < info.min_price {
                return Err(ExchangeError::InvalidPrice);
            }
            body["price"] = Value::String(format_step(price, info.tick_size));
        } else if kind == OrderKind::Limit {
            return Err(ExchangeError::InvalidPrice);
        }

        if reduce_only {
            body["reduceOnly"] = Value::Bool(true);
        }
        if let Some(idx) = self.position_idx(position_side) {
            body["positionIdx"] = Value::from(idx);
        }

        let result = self.post_signed("/v5/order/create", &body).await?;
        let order_id = result
            .get("orderId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if order_id.is_empty() {
            return Err(ExchangeError::BadResponse("order create without orderId".into()));
        }

        debug!(symbol, order_side, kind = kind.as_str(), qty, link_id, %order_id, "order placed");
        Ok(order_id)
    }

    /// Amend a resting order's price (cheaper than cancel + replace).
    pub async fn amend_price(
        &self,
        symbol: &str,
        order_id: &str,
        new_price: f64,
        position_side: Side,
    ) -> Result<(), ExchangeError> {
        let info = self.instrument(symbol).await?;
        // DCA orders are open-side orders: Buy for longs, Sell for shorts.
        let price = round_limit_price(new_price, info.tick_size, position_side);

        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
            "price": format_step(price, info.tick_size),
        });
        self.post_signed("/v5/order/amend", &body).await?;
        info!(symbol, order_id, price, "order amended");
        Ok(())
    }

    /// Cancel one order. An already-gone order is success (idempotent cancel).
    pub async fn cancel(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        match self.post_signed("/v5/order/cancel", &body).await {
            Ok(_) => Ok(()),
            Err(ExchangeError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cancel every open order for a symbol.
    pub async fn cancel_all(&self, symbol: &str) -> Result<(), ExchangeError> {
        let body = json!({
            "category": "linear",
            "symbol": symbol,
        });
        self.post_signed("/v5/order/cancel-all", &body).await?;
        info!(symbol, "all orders cancelled");
        Ok(())
    }

    /// Look up one order by id, checking the realtime book first and falling
    /// back to history for orders that already left it.
    pub async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderStatus>, ExchangeError> {
        let query = format!("category=linear&symbol={symbol}&orderId={order_id}");

        let result = self.get_signed("/v5/order/realtime", &query).await?;
        let mut orders: Vec<RawOrder> = Self::parse_list(result)?;
        if orders.is_empty() {
            let result = self.get_signed("/v5/order/history", &query).await?;
            orders = Self::parse_list(result)?;
        }

        Ok(orders.first().map(OrderStatus::from))
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Current non-zero position for a symbol (optionally filtered by side).
    pub async fn position(
        &self,
        symbol: &str,
        side: Option<Side>,
    ) -> Result<Option<PositionInfo>, ExchangeError> {
        let query = format!("category=linear&symbol={symbol}");
        let result = self.get_signed("/v5/position/list", &query).await?;
        let raw: Vec<RawPosition> = Self::parse_list(result)?;

        Ok(raw
            .iter()
            .filter_map(PositionInfo::from_raw)
            .find(|p| side.map_or(true, |s| p.side == s)))
    }

    /// All open USDT-settled positions (orphan detection).
    pub async fn all_positions(&self) -> Result<Vec<PositionInfo>, ExchangeError> {
        let result = self
            .get_signed("/v5/position/list", "category=linear&settleCoin=USDT")
            .await?;
        let raw: Vec<RawPosition> = Self::parse_list(result)?;
        Ok(raw.iter().filter_map(PositionInfo::from_raw).collect())
    }

    // -------------------------------------------------------------------------
    // Closed PnL
    // -------------------------------------------------------------------------

    /// Closed-PnL records since `start_time_ms`, newest first from the
    /// exchange. One record per execution fill; the sync loop aggregates.
    pub async fn closed_pnl(
        &self,
        start_time_ms: i64,
        limit: u32,
    ) -> Result<Vec<ClosedPnlRecord>, ExchangeError> {
        let mut query = format!("category=linear&limit={limit}");
        if start_time_ms > 0 {
            query.push_str(&format!("&startTime={start_time_ms}"));
        }
        let result = self.get_signed("/v5/position/closed-pnl", &query).await?;
        let raw: Vec<RawClosedPnl> = Self::parse_list(result)?;
        Ok(raw.iter().filter_map(ClosedPnlRecord::from_raw).collect())
    }

    // -------------------------------------------------------------------------
    // Conditional stops
    // -------------------------------------------------------------------------

    /// Set exchange-side SL and/or trailing stop on a position.
    ///
    /// Returns `verified = true` iff the exchange acknowledged the values or
    /// reported them unchanged (retCode 34040, "not modified", is a success
    /// signal, not an error). The safety loop retries unverified stops on
    /// its next tick.
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        side: Side,
        stop_loss: Option<f64>,
        trailing_stop: Option<f64>,
        active_price: Option<f64>,
    ) -> Result<bool, ExchangeError> {
        let info = self.instrument(symbol).await?;

        let mut body = json!({
            "category": "linear",
            "symbol": symbol,
            "tpslMode": "Full",
        });
        if let Some(sl) = stop_loss {
            body["stopLoss"] =
                Value::String(format_step(round_price_down(sl, info.tick_size), info.tick_size));
        }
        if let Some(dist) = trailing_stop {
            body["trailingStop"] =
                Value::String(format_step(round_price_down(dist, info.tick_size), info.tick_size));
        }
        if let Some(ap) = active_price {
            body["activePrice"] =
                Value::String(format_step(round_price_down(ap, info.tick_size), info.tick_size));
        }
        if let Some(idx) = self.position_idx(side) {
            body["positionIdx"] = Value::from(idx);
        } else {
            body["positionIdx"] = Value::from(0);
        }

        match self.post_signed("/v5/position/trading-stop", &body).await {
            Ok(_) => {
                debug!(symbol, ?stop_loss, ?trailing_stop, "trading stop set");
                Ok(true)
            }
            Err(ExchangeError::Api { code: 34040, .. }) => {
                debug!(symbol, "trading stop unchanged");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

fn is_not_modified(e: &ExchangeError) -> bool {
    match e {
        ExchangeError::Api { code, .. } => matches!(*code, 110026 | 110027 | 110043 | 34040),
        _ => false,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
