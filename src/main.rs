// =============================================================================
// Helios DCA Bot — Main Entry Point
// =============================================================================
//
// Signal flow: channel/webhook -> parser -> admission buffer -> trade manager
// -> exchange orders. Four steady loops reconcile state afterwards: the
// price monitor (fills + SL ladder), the zone refresher, the safety monitor
// (stop verification), and the closed-PnL sync. Startup recovery runs to
// completion before any loop starts.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod bybit;
mod config;
mod orchestrator;
mod parser;
mod store;
mod telegram;
mod trade;
mod trade_manager;
mod types;
mod zones;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::bybit::BybitClient;
use crate::config::BotConfig;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║             Helios DCA Bot — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = BotConfig::load("config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        let mut cfg = BotConfig::default();
        cfg.apply_env();
        cfg
    });

    if config.bybit_api_key.is_empty() {
        warn!("BYBIT_API_KEY not set - exchange calls will be rejected");
    }
    info!(
        leverage = config.leverage,
        equity_pct = config.equity_pct_per_trade,
        max_trades = config.max_simultaneous_trades,
        dca_levels = config.max_dca_levels,
        testnet = config.bybit_testnet,
        "engine configuration"
    );

    // ── 2. Store + zone cache warmup ─────────────────────────────────────
    let store = Store::connect(&config.database_url).await;
    store.init().await;

    // ── 3. Exchange client ───────────────────────────────────────────────
    let exchange = BybitClient::new(
        config.bybit_api_key.clone(),
        config.bybit_api_secret.clone(),
        config.bybit_testnet,
    );

    // ── 4. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, exchange, store));
    state.zones.warm(state.store.all_zones().await);

    // ── 5. Startup recovery (before any steady loop) ─────────────────────
    orchestrator::safety::recover(&state).await;

    // ── 6. HTTP surface ──────────────────────────────────────────────────
    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    let api_state = state.clone();
    let api_addr = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&api_addr).await {
            Ok(listener) => {
                info!(addr = %api_addr, "HTTP surface listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "HTTP server failed");
                }
            }
            Err(e) => error!(addr = %api_addr, error = %e, "HTTP bind failed"),
        }
    });

    // ── 7. Steady loops ──────────────────────────────────────────────────
    let monitor = tokio::spawn(orchestrator::monitor::run_price_monitor(state.clone()));
    let zone_refresh = tokio::spawn(orchestrator::zone_loop::run_zone_refresh(state.clone()));
    let safety = tokio::spawn(orchestrator::safety::run_safety_monitor(state.clone()));
    let sync = tokio::spawn(orchestrator::sync::run_closed_pnl_sync(state.clone()));
    let listener = tokio::spawn(telegram::run_telegram_listener(state.clone()));

    info!("all subsystems running");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping loops");

    monitor.abort();
    zone_refresh.abort();
    safety.abort();
    sync.abort();
    listener.abort();

    // Open positions stay on the exchange; the persisted snapshots are the
    // durable record for the next startup's recovery.
    info!(
        active_trades = state.trades.active_count(),
        "Helios shut down complete"
    );
    Ok(())
}
