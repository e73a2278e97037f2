// =============================================================================
// HTTP surface — Axum 0.7
// =============================================================================
//
// Thin adapters over the orchestrator: the webhook feeds the admission
// buffer, the zone endpoints feed the zone source, the rest is operator
// tooling and the dashboard. CORS is permissive; this surface is expected to
// sit behind a private network or reverse proxy.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::orchestrator::{admission, events, zone_loop};
use crate::parser::parse_signal;
use crate::types::{unix_now, TrendDirection};
use crate::zones::{CoinZones, ZoneSource};

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(dashboard))
        .route("/webhook", post(webhook))
        .route("/close/:symbol", post(close_symbol))
        .route("/flush", post(flush))
        .route("/signal/trend-switch", post(trend_switch))
        .route("/zones/push", post(zones_push))
        .route("/zones/:symbol", post(zones_set))
        .route("/zones", get(zones_list))
        .route("/status", get(status))
        .route("/trades", get(trades))
        .route("/equity", get(equity))
        .route("/recovery/reset", post(recovery_reset))
        .layer(cors)
        .with_state(state)
}

/// "HYPEUSDT.P" -> "HYPEUSDT", "HYPE/USDT" -> "HYPEUSDT".
fn clean_symbol(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .replace('/', "")
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

// =============================================================================
// Signals
// =============================================================================

/// Raw signal text, or JSON with a `message`/`text` field.
async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let message = if content_type.contains("json") {
        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("text"))
                    .and_then(|m| m.as_str().map(|s| s.to_string()))
            })
            .unwrap_or_default()
    } else {
        body
    };

    if message.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "reason": "empty message"})),
        );
    }

    info!(preview = %message.chars().take(80).collect::<String>(), "webhook received");

    match parse_signal(&message, state.config.fallback_signal_leverage) {
        Some(signal) => {
            let outcome = admission::add_signal(&state, signal).await;
            (StatusCode::OK, Json(serde_json::to_value(outcome).unwrap_or_default()))
        }
        None => (
            StatusCode::OK,
            Json(json!({"status": "ignored", "reason": "not a valid signal"})),
        ),
    }
}

async fn close_symbol(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    match events::handle_close_command(&state, &symbol, "Manual close").await {
        Some(result) => (StatusCode::OK, Json(result)),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "reason": format!("no active trade for {symbol}")})),
        ),
    }
}

async fn flush(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let results = admission::flush_batch(&state).await;
    Json(json!({"status": "flushed", "results": results}))
}

// =============================================================================
// Trend switch
// =============================================================================

/// JSON `{"symbol": "HYPEUSDT", "direction": "up"}` or plain `"HYPEUSDT up"`.
async fn trend_switch(
    State(state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    let text = body.trim();

    let (symbol, direction) = if text.starts_with('{') {
        match serde_json::from_str::<Value>(text) {
            Ok(v) => (
                clean_symbol(v.get("symbol").and_then(|s| s.as_str()).unwrap_or_default()),
                v.get("direction")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
            ),
            Err(_) => (String::new(), String::new()),
        }
    } else {
        let mut parts = text.split_whitespace();
        (
            clean_symbol(parts.next().unwrap_or_default()),
            parts.next().unwrap_or_default().to_string(),
        )
    };

    let Some(direction) = TrendDirection::parse(&direction) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "reason": "invalid symbol or direction"})),
        );
    };
    if symbol.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "reason": "symbol missing"})),
        );
    }

    let closed = events::handle_trend_switch(&state, &symbol, direction).await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "symbol": symbol,
            "direction": direction,
            "closed_side": direction.opposing_side(),
            "closed": closed,
        })),
    )
}

// =============================================================================
// Zones
// =============================================================================

/// Strip the charting platform's `@alert("...") = condition` wrapper and
/// re-brace the payload it mangles.
fn extract_push_payload(text: &str) -> String {
    let mut text = text.trim().to_string();

    if text.starts_with("@alert(") {
        if let (Some(start), Some(end)) = (text.find("(\""), text.find("\") =")) {
            if start < end {
                text = text[start + 2..end].replace("\\\"", "\"");
            }
        }
    }

    if !text.starts_with('{') {
        text = format!("{{{text}}}");
    }
    text
}

fn lenient_field(body: &Value, key: &str) -> f64 {
    match body.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// External zone push, optionally carrying trend scalars whose sign flips
/// the trend marker.
async fn zones_push(
    State(state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    let payload = extract_push_payload(&body);
    let Ok(parsed) = serde_json::from_str::<Value>(&payload) else {
        warn!(preview = %payload.chars().take(120).collect::<String>(), "zone push: invalid JSON");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "reason": "invalid JSON"})),
        );
    };

    let raw_symbol = parsed
        .get("symbol")
        .and_then(|s| s.as_str())
        .unwrap_or_default();
    if raw_symbol.is_empty() || raw_symbol.eq_ignore_ascii_case("nan") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "reason": "symbol missing or NaN"})),
        );
    }
    let symbol = clean_symbol(raw_symbol);

    let mut zones = CoinZones {
        symbol: symbol.clone(),
        s1: lenient_field(&parsed, "s1"),
        s2: lenient_field(&parsed, "s2"),
        s3: lenient_field(&parsed, "s3"),
        r1: lenient_field(&parsed, "r1"),
        r2: lenient_field(&parsed, "r2"),
        r3: lenient_field(&parsed, "r3"),
        updated_at: unix_now(),
        source: ZoneSource::External,
    };
    zones.complete_missing_levels(lenient_field(&parsed, "rz_avg"));

    state.zones.insert(zones.clone());
    state.store.upsert_zone(&zones).await;
    info!(symbol = %symbol, s1 = zones.s1, r1 = zones.r1, "external zones stored");

    zone_loop::resnap_active_dcas(&state, &symbol).await;

    // Optional trend scalars: lead above lag means uptrend. A flip closes
    // opposing positions; the first observation just seeds the marker.
    let mut trend_result = Value::Null;
    let lead = lenient_field(&parsed, "neo_lead");
    let lag = lenient_field(&parsed, "neo_lag");
    if lead != 0.0 && parsed.get("neo_lag").is_some() {
        let new_direction = if lead > lag {
            TrendDirection::Up
        } else {
            TrendDirection::Down
        };
        let old_direction = state.store.get_trend(&symbol).await;

        match old_direction {
            Some(old) if old != new_direction => {
                let closed = events::handle_trend_switch(&state, &symbol, new_direction).await;
                trend_result = json!({
                    "switch": true,
                    "from": old,
                    "to": new_direction,
                    "closed": closed,
                });
            }
            _ => {
                state.store.set_trend(&symbol, new_direction).await;
                trend_result = json!({"switch": false, "direction": new_direction});
            }
        }
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "symbol": symbol,
            "zones": {"s1": zones.s1, "r1": zones.r1},
            "trend": trend_result,
        })),
    )
}

/// Manual zone overwrite.
async fn zones_set(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let symbol = clean_symbol(&symbol);

    let zones = CoinZones {
        symbol: symbol.clone(),
        s1: lenient_field(&body, "s1"),
        s2: lenient_field(&body, "s2"),
        s3: lenient_field(&body, "s3"),
        r1: lenient_field(&body, "r1"),
        r2: lenient_field(&body, "r2"),
        r3: lenient_field(&body, "r3"),
        updated_at: unix_now(),
        source: ZoneSource::Manual,
    };

    state.zones.insert(zones.clone());
    state.store.upsert_zone(&zones).await;
    zone_loop::resnap_active_dcas(&state, &symbol).await;

    Json(json!({
        "status": "ok",
        "symbol": symbol,
        "source": zones.source,
        "zones": {
            "s1": zones.s1, "s2": zones.s2, "s3": zones.s3,
            "r1": zones.r1, "r2": zones.r2, "r3": zones.r3,
        },
    }))
}

async fn zones_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = unix_now();
    let stale = state.config.zone_stale_minutes;
    let mut result = serde_json::Map::new();
    for z in state.zones.snapshot() {
        result.insert(
            z.symbol.clone(),
            json!({
                "s1": z.s1, "s2": z.s2, "s3": z.s3,
                "r1": z.r1, "r2": z.r2, "r3": z.r3,
                "source": z.source,
                "age_min": (z.age_minutes(now) * 10.0).round() / 10.0,
                "valid": z.is_valid(now, stale),
            }),
        );
    }
    Json(Value::Object(result))
}

// =============================================================================
// Dashboard data
// =============================================================================

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cfg = &state.config;
    let now = unix_now();

    let active: Vec<Value> = state
        .trades
        .active_trades()
        .iter()
        .map(|t| {
            json!({
                "symbol": t.symbol_display,
                "side": t.side,
                "entry": t.signal_entry,
                "avg": t.avg_price,
                "dca": format!("{}/{}", t.current_dca, t.max_dca),
                "tps": format!("{}/{}", t.tps_hit, t.tp_prices.len()),
                "margin": t.total_margin,
                "status": t.status.to_string(),
                "age_hours": (t.age_hours(now) * 10.0).round() / 10.0,
                "sl": t.hard_sl_price,
                "quick_trail": t.quick_trail_active,
                "scale_in": t.scale_in_filled,
            })
        })
        .collect();

    let counters = state.trades.counters();
    let total = counters.wins + counters.losses + counters.breakeven;
    let equity = state.exchange.get_equity().await.ok();

    Json(json!({
        "active_trades": active,
        "slots": format!("{}/{}", state.trades.active_count(), cfg.max_simultaneous_trades),
        "buffer": state.batch.len(),
        "equity": equity,
        "stats": {
            "wins": counters.wins,
            "losses": counters.losses,
            "breakeven": counters.breakeven,
            "total": total,
            "win_rate": if total > 0 {
                format!("{:.1}%", counters.wins as f64 / total as f64 * 100.0)
            } else {
                "0%".to_string()
            },
            "total_pnl": counters.total_pnl,
        },
        "config": {
            "leverage": cfg.leverage,
            "equity_pct": cfg.equity_pct_per_trade,
            "max_trades": cfg.max_simultaneous_trades,
            "max_fills_per_batch": cfg.max_fills_per_batch,
            "dca_levels": cfg.max_dca_levels,
            "dca_mults": cfg.dca_multipliers,
            "dca_spacing": cfg.dca_spacing_pct,
            "tp_pcts": cfg.tp_close_pcts,
            "trail_pct": cfg.trail_remainder_pct(),
            "trail_cb": cfg.trailing_callback_pct,
            "safety_sl_pct": cfg.safety_sl_pct,
            "hard_sl_pct": cfg.hard_sl_pct,
            "dca_tp_pcts": cfg.dca_tp_pcts,
            "dca_trail_cb": cfg.dca_trail_callback_pct,
            "scale_in": cfg.scale_in_enabled,
            "zones": cfg.zone_snap_enabled,
            "trend_filter": cfg.trend_filter_enabled,
            "testnet": cfg.bybit_testnet,
        },
    }))
}

async fn trades(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.store.trade_stats().await;
    let trades = state.store.recent_trades(50).await;
    Json(json!({"stats": stats, "trades": trades}))
}

async fn equity(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let history = state.store.equity_history(90).await;
    Json(json!({"history": history}))
}

/// Emergency: clear in-memory trades and active snapshots. Positions on the
/// exchange are untouched; they surface as orphans on the next safety scan.
async fn recovery_reset(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cleared_mem = state.trades.clear();
    let cleared_db = state.store.clear_active_trades().await;
    warn!(cleared_mem, cleared_db, "RECOVERY RESET: trade state cleared");
    Json(json!({
        "status": "ok",
        "cleared": cleared_mem,
        "warning": "trades cleared from bot state; exchange positions untouched",
    }))
}

// =============================================================================
// Dashboard (HTML)
// =============================================================================

async fn dashboard() -> impl IntoResponse {
    Html(
        r#"<!DOCTYPE html>
<html><head>
<title>Helios DCA Bot</title>
<meta charset="utf-8">
<style>
    body { background: #0d1117; color: #c9d1d9; font-family: monospace; padding: 20px; }
    h1 { color: #58a6ff; }
    .card { background: #161b22; border: 1px solid #30363d; border-radius: 8px; padding: 16px; margin: 10px 0; }
    .green { color: #3fb950; } .red { color: #f85149; } .yellow { color: #d29922; }
    table { width: 100%; border-collapse: collapse; }
    th, td { text-align: left; padding: 8px; border-bottom: 1px solid #21262d; }
    th { color: #8b949e; }
</style>
</head><body>
<h1>Helios DCA Bot</h1>
<div id="dashboard">Loading...</div>
<script>
async function update() {
    const res = await fetch('/status');
    const d = await res.json();
    let html = '';

    html += '<div class="card">';
    html += `<b>Config:</b> ${d.config.leverage}x | ${d.config.equity_pct}% eq/trade | `;
    html += `max ${d.config.max_trades} trades | ${d.config.dca_levels} DCA ${JSON.stringify(d.config.dca_mults)} | `;
    html += `TP ${d.config.tp_pcts.join('/')}% + trail ${d.config.trail_pct}% (${d.config.trail_cb}% CB) | `;
    html += d.config.testnet ? '<span class="yellow">TESTNET</span>' : '<span class="red">LIVE</span>';
    html += d.equity ? ` | Equity: <b>$${d.equity.toFixed(2)}</b>` : '';
    html += '</div>';

    html += '<div class="card">';
    html += `<b>Stats:</b> slots <b>${d.slots}</b> | buffer ${d.buffer} | `;
    html += `<span class="green">${d.stats.wins}W</span> / <span class="red">${d.stats.losses}L</span> / ${d.stats.breakeven}BE | `;
    html += `WR ${d.stats.win_rate} | PnL <b class="${d.stats.total_pnl < 0 ? 'red' : 'green'}">$${d.stats.total_pnl.toFixed(2)}</b>`;
    html += '</div>';

    if (d.active_trades.length > 0) {
        html += '<div class="card"><b>Active Trades</b>';
        html += '<table><tr><th>Symbol</th><th>Side</th><th>Entry</th><th>Avg</th><th>DCA</th><th>TPs</th><th>SL</th><th>Status</th><th>Age</th></tr>';
        for (const t of d.active_trades) {
            const sc = t.side === 'long' ? 'green' : 'red';
            html += `<tr><td><b>${t.symbol}</b></td><td class="${sc}">${t.side.toUpperCase()}</td>`;
            html += `<td>${t.entry}</td><td>${t.avg.toFixed(4)}</td><td>${t.dca}</td>`;
            html += `<td class="green">${t.tps}</td><td>${t.sl > 0 ? t.sl.toFixed(4) : '-'}</td>`;
            html += `<td>${t.status}</td><td>${t.age_hours}h</td></tr>`;
        }
        html += '</table></div>';
    } else {
        html += '<div class="card"><span class="yellow">No active trades</span></div>';
    }

    document.getElementById('dashboard').innerHTML = html;
}
update();
setInterval(update, 10000);
</script>
</body></html>"#,
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_cleaning() {
        assert_eq!(clean_symbol("HYPE/USDT"), "HYPEUSDT");
        assert_eq!(clean_symbol("HYPEUSDT.P"), "HYPEUSDT");
        assert_eq!(clean_symbol(" hypeusdt "), "HYPEUSDT");
        assert_eq!(clean_symbol(""), "");
    }

    #[test]
    fn push_payload_unwraps_alert_script() {
        let raw = r#"@alert("\"symbol\":\"HYPEUSDT\",\"s1\":42.1,\"r1\":45.9") = cross"#;
        let payload = extract_push_payload(raw);
        let v: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["symbol"], "HYPEUSDT");
        assert_eq!(lenient_field(&v, "s1"), 42.1);
    }

    #[test]
    fn push_payload_braces_bare_pairs() {
        let payload = extract_push_payload(r#""symbol":"FOOUSDT","s1":1.5,"r1":2.5"#);
        let v: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["symbol"], "FOOUSDT");
        assert_eq!(lenient_field(&v, "r1"), 2.5);
    }

    #[test]
    fn push_payload_passes_json_through() {
        let payload = extract_push_payload(r#"{"symbol":"FOOUSDT","s1":1}"#);
        let v: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["symbol"], "FOOUSDT");
    }

    #[test]
    fn lenient_field_accepts_strings_and_numbers() {
        let v: Value = serde_json::from_str(r#"{"a": 1.5, "b": "2.5", "c": null}"#).unwrap();
        assert_eq!(lenient_field(&v, "a"), 1.5);
        assert_eq!(lenient_field(&v, "b"), 2.5);
        assert_eq!(lenient_field(&v, "c"), 0.0);
        assert_eq!(lenient_field(&v, "missing"), 0.0);
    }
}
