// =============================================================================
// Persistence Store — SQLite via sqlx, five tables with single-writer roles
// =============================================================================
//
//   zones          upserted by the zone source
//   closed_trades  append-only journal, idempotent on trade_id
//   active_trades  full Trade snapshot per state change, deleted on close
//   daily_equity   one row per day: equity, pnl, win/loss counts
//   trend_markers  last-known trend direction per symbol
//
// Failure isolation: a store outage must never block the trading loop. Every
// operation logs its own error and returns a default ("unknown") so callers
// degrade to in-memory behaviour. With no DATABASE_URL the store runs
// disabled and every call is a no-op.
// =============================================================================

use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{error, info, warn};

use crate::trade::{ClosedTrade, Trade};
use crate::types::{Side, TrendDirection};
use crate::zones::{CoinZones, ZoneSource};

/// Aggregate journal statistics for the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeStats {
    pub total: i64,
    pub wins: i64,
    pub losses: i64,
    pub breakeven: i64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub win_rate: f64,
}

/// One row of the daily equity series.
#[derive(Debug, Clone, Serialize)]
pub struct DailyEquity {
    pub date: String,
    pub equity: f64,
    pub daily_pnl: f64,
    pub wins: i64,
    pub losses: i64,
}

/// SQLite-backed store. `pool` is `None` when persistence is disabled.
pub struct Store {
    pool: Option<SqlitePool>,
}

impl Store {
    /// Connect to `url`, or run disabled when it is empty or unreachable.
    pub async fn connect(url: &str) -> Self {
        if url.is_empty() {
            warn!("no DATABASE_URL - running in memory-only mode");
            return Self { pool: None };
        }

        match SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
        {
            Ok(pool) => {
                info!("database connected");
                Self { pool: Some(pool) }
            }
            Err(e) => {
                error!(error = %e, "database connection failed - memory-only mode");
                Self { pool: None }
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Create tables if they do not exist.
    pub async fn init(&self) {
        let Some(pool) = &self.pool else { return };

        let ddl = [
            "CREATE TABLE IF NOT EXISTS zones (
                symbol TEXT PRIMARY KEY,
                s1 REAL DEFAULT 0, s2 REAL DEFAULT 0, s3 REAL DEFAULT 0,
                r1 REAL DEFAULT 0, r2 REAL DEFAULT 0, r3 REAL DEFAULT 0,
                source TEXT DEFAULT 'derived',
                updated_at REAL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS closed_trades (
                trade_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL, avg_price REAL, close_price REAL,
                total_qty REAL, total_margin REAL,
                realized_pnl REAL DEFAULT 0,
                max_dca_reached INTEGER DEFAULT 0,
                tps_hit INTEGER DEFAULT 0,
                close_reason TEXT,
                opened_at REAL, closed_at REAL,
                signal_leverage INTEGER DEFAULT 0,
                equity_at_entry REAL DEFAULT 0,
                equity_at_close REAL DEFAULT 0,
                trail_pnl_pct REAL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS active_trades (
                trade_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at REAL DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS daily_equity (
                date TEXT PRIMARY KEY,
                equity REAL DEFAULT 0,
                daily_pnl REAL DEFAULT 0,
                wins INTEGER DEFAULT 0,
                losses INTEGER DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS trend_markers (
                symbol TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                updated_at REAL DEFAULT 0
            )",
        ];

        for stmt in ddl {
            if let Err(e) = sqlx::query(stmt).execute(pool).await {
                error!(error = %e, "table creation failed");
                return;
            }
        }
        info!("database tables initialized");
    }

    // =========================================================================
    // Zones
    // =========================================================================

    pub async fn upsert_zone(&self, zones: &CoinZones) -> bool {
        let Some(pool) = &self.pool else { return false };

        let result = sqlx::query(
            "INSERT INTO zones (symbol, s1, s2, s3, r1, r2, r3, source, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(symbol) DO UPDATE SET
                s1=excluded.s1, s2=excluded.s2, s3=excluded.s3,
                r1=excluded.r1, r2=excluded.r2, r3=excluded.r3,
                source=excluded.source, updated_at=excluded.updated_at",
        )
        .bind(&zones.symbol)
        .bind(zones.s1)
        .bind(zones.s2)
        .bind(zones.s3)
        .bind(zones.r1)
        .bind(zones.r2)
        .bind(zones.r3)
        .bind(zones.source.as_str())
        .bind(zones.updated_at)
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(symbol = %zones.symbol, error = %e, "zone upsert failed");
            return false;
        }
        true
    }

    pub async fn get_zone(&self, symbol: &str) -> Option<CoinZones> {
        let Some(pool) = &self.pool else { return None };

        let row = sqlx::query("SELECT * FROM zones WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(pool)
            .await
            .map_err(|e| error!(symbol, error = %e, "zone read failed"))
            .ok()??;

        Self::row_to_zones(&row)
    }

    fn row_to_zones(row: &sqlx::sqlite::SqliteRow) -> Option<CoinZones> {
        Some(CoinZones {
            symbol: row.try_get("symbol").ok()?,
            s1: row.try_get("s1").unwrap_or(0.0),
            s2: row.try_get("s2").unwrap_or(0.0),
            s3: row.try_get("s3").unwrap_or(0.0),
            r1: row.try_get("r1").unwrap_or(0.0),
            r2: row.try_get("r2").unwrap_or(0.0),
            r3: row.try_get("r3").unwrap_or(0.0),
            updated_at: row.try_get("updated_at").unwrap_or(0.0),
            source: ZoneSource::parse(
                &row.try_get::<String, _>("source").unwrap_or_default(),
            ),
        })
    }

    pub async fn all_zones(&self) -> Vec<CoinZones> {
        let Some(pool) = &self.pool else { return Vec::new() };

        let rows = match sqlx::query("SELECT * FROM zones ORDER BY updated_at DESC")
            .fetch_all(pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "zone list read failed");
                return Vec::new();
            }
        };

        rows.iter().filter_map(Self::row_to_zones).collect()
    }

    // =========================================================================
    // Closed trades (journal)
    // =========================================================================

    /// Idempotent on trade_id: replays update the PnL and close fields but
    /// never touch opened_at.
    pub async fn save_closed_trade(&self, rec: &ClosedTrade) -> bool {
        let Some(pool) = &self.pool else { return false };

        let result = sqlx::query(
            "INSERT INTO closed_trades
                (trade_id, symbol, side, entry_price, avg_price, close_price,
                 total_qty, total_margin, realized_pnl, max_dca_reached,
                 tps_hit, close_reason, opened_at, closed_at, signal_leverage,
                 equity_at_entry, equity_at_close, trail_pnl_pct)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(trade_id) DO UPDATE SET
                realized_pnl=excluded.realized_pnl,
                close_price=excluded.close_price,
                close_reason=excluded.close_reason,
                closed_at=excluded.closed_at,
                equity_at_close=excluded.equity_at_close,
                trail_pnl_pct=excluded.trail_pnl_pct",
        )
        .bind(&rec.trade_id)
        .bind(&rec.symbol)
        .bind(rec.side.to_string())
        .bind(rec.entry_price)
        .bind(rec.avg_price)
        .bind(rec.close_price)
        .bind(rec.total_qty)
        .bind(rec.total_margin)
        .bind(rec.realized_pnl)
        .bind(rec.max_dca_reached as i64)
        .bind(rec.tps_hit as i64)
        .bind(&rec.close_reason)
        .bind(rec.opened_at)
        .bind(rec.closed_at)
        .bind(rec.signal_leverage as i64)
        .bind(rec.equity_at_entry)
        .bind(rec.equity_at_close)
        .bind(rec.trail_pnl_pct)
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(trade_id = %rec.trade_id, error = %e, "closed trade save failed");
            return false;
        }
        true
    }

    pub async fn recent_trades(&self, limit: i64) -> Vec<ClosedTrade> {
        let Some(pool) = &self.pool else { return Vec::new() };

        let rows = match sqlx::query(
            "SELECT * FROM closed_trades ORDER BY closed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "recent trades read failed");
                return Vec::new();
            }
        };

        rows.iter().filter_map(Self::row_to_closed_trade).collect()
    }

    fn row_to_closed_trade(row: &sqlx::sqlite::SqliteRow) -> Option<ClosedTrade> {
        let side = match row.try_get::<String, _>("side").ok()?.as_str() {
            "short" => Side::Short,
            _ => Side::Long,
        };
        Some(ClosedTrade {
            trade_id: row.try_get("trade_id").ok()?,
            symbol: row.try_get("symbol").ok()?,
            side,
            entry_price: row.try_get("entry_price").unwrap_or(0.0),
            avg_price: row.try_get("avg_price").unwrap_or(0.0),
            close_price: row.try_get("close_price").unwrap_or(0.0),
            total_qty: row.try_get("total_qty").unwrap_or(0.0),
            total_margin: row.try_get("total_margin").unwrap_or(0.0),
            realized_pnl: row.try_get("realized_pnl").unwrap_or(0.0),
            max_dca_reached: row.try_get::<i64, _>("max_dca_reached").unwrap_or(0) as usize,
            tps_hit: row.try_get::<i64, _>("tps_hit").unwrap_or(0) as usize,
            close_reason: row.try_get("close_reason").unwrap_or_default(),
            opened_at: row.try_get("opened_at").unwrap_or(0.0),
            closed_at: row.try_get("closed_at").unwrap_or(0.0),
            signal_leverage: row.try_get::<i64, _>("signal_leverage").unwrap_or(0) as u32,
            equity_at_entry: row.try_get("equity_at_entry").unwrap_or(0.0),
            equity_at_close: row.try_get("equity_at_close").unwrap_or(0.0),
            trail_pnl_pct: row.try_get("trail_pnl_pct").unwrap_or(0.0),
        })
    }

    pub async fn trade_stats(&self) -> TradeStats {
        let Some(pool) = &self.pool else { return TradeStats::default() };

        let row = match sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN realized_pnl > 0.01 THEN 1 ELSE 0 END), 0) AS wins,
                COALESCE(SUM(CASE WHEN realized_pnl < -0.01 THEN 1 ELSE 0 END), 0) AS losses,
                COALESCE(SUM(realized_pnl), 0) AS total_pnl,
                COALESCE(AVG(realized_pnl), 0) AS avg_pnl,
                COALESCE(MAX(realized_pnl), 0) AS best_trade,
                COALESCE(MIN(realized_pnl), 0) AS worst_trade
             FROM closed_trades",
        )
        .fetch_one(pool)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, "trade stats read failed");
                return TradeStats::default();
            }
        };

        let total: i64 = row.try_get("total").unwrap_or(0);
        let wins: i64 = row.try_get("wins").unwrap_or(0);
        let losses: i64 = row.try_get("losses").unwrap_or(0);
        TradeStats {
            total,
            wins,
            losses,
            breakeven: total - wins - losses,
            total_pnl: row.try_get("total_pnl").unwrap_or(0.0),
            avg_pnl: row.try_get("avg_pnl").unwrap_or(0.0),
            best_trade: row.try_get("best_trade").unwrap_or(0.0),
            worst_trade: row.try_get("worst_trade").unwrap_or(0.0),
            win_rate: if total > 0 {
                wins as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    // --- Dedup lookups for the exchange sync loop ---------------------------

    /// A journal entry for this symbol whose opened_at is within `window`
    /// seconds of `t`.
    pub async fn has_trade_near_open(&self, symbol: &str, t: f64, window: f64) -> bool {
        self.exists(
            "SELECT 1 FROM closed_trades WHERE symbol = ? AND ABS(opened_at - ?) <= ? LIMIT 1",
            symbol,
            t,
            window,
        )
        .await
    }

    /// A journal entry for this symbol whose closed_at is within `window`
    /// seconds of `t`.
    pub async fn has_trade_near_close(&self, symbol: &str, t: f64, window: f64) -> bool {
        self.exists(
            "SELECT 1 FROM closed_trades WHERE symbol = ? AND ABS(closed_at - ?) <= ? LIMIT 1",
            symbol,
            t,
            window,
        )
        .await
    }

    /// A journal entry for this symbol whose lifetime contains `t` (catches
    /// partial-close records inside a tracked trade's window).
    pub async fn has_trade_covering(&self, symbol: &str, t: f64) -> bool {
        let Some(pool) = &self.pool else { return false };
        match sqlx::query(
            "SELECT 1 FROM closed_trades
             WHERE symbol = ? AND opened_at <= ? AND closed_at >= ? LIMIT 1",
        )
        .bind(symbol)
        .bind(t)
        .bind(t)
        .fetch_optional(pool)
        .await
        {
            Ok(row) => row.is_some(),
            Err(e) => {
                error!(symbol, error = %e, "journal lookup failed");
                false
            }
        }
    }

    async fn exists(&self, sql: &str, symbol: &str, t: f64, window: f64) -> bool {
        let Some(pool) = &self.pool else { return false };
        match sqlx::query(sql)
            .bind(symbol)
            .bind(t)
            .bind(window)
            .fetch_optional(pool)
            .await
        {
            Ok(row) => row.is_some(),
            Err(e) => {
                error!(symbol, error = %e, "journal lookup failed");
                false
            }
        }
    }

    // =========================================================================
    // Active trade snapshots
    // =========================================================================

    pub async fn save_active_trade(&self, trade: &Trade) -> bool {
        let Some(pool) = &self.pool else { return false };

        let state = match serde_json::to_string(trade) {
            Ok(s) => s,
            Err(e) => {
                error!(trade_id = %trade.trade_id, error = %e, "trade serialization failed");
                return false;
            }
        };

        let result = sqlx::query(
            "INSERT INTO active_trades (trade_id, symbol, side, status, state, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(trade_id) DO UPDATE SET
                status=excluded.status, state=excluded.state, updated_at=excluded.updated_at",
        )
        .bind(&trade.trade_id)
        .bind(&trade.symbol)
        .bind(trade.side.to_string())
        .bind(trade.status.to_string())
        .bind(state)
        .bind(crate::types::unix_now())
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(trade_id = %trade.trade_id, error = %e, "active trade save failed");
            return false;
        }
        true
    }

    pub async fn delete_active_trade(&self, trade_id: &str) -> bool {
        let Some(pool) = &self.pool else { return false };

        match sqlx::query("DELETE FROM active_trades WHERE trade_id = ?")
            .bind(trade_id)
            .execute(pool)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(trade_id, error = %e, "active trade delete failed");
                false
            }
        }
    }

    pub async fn load_active_trades(&self) -> Vec<Trade> {
        let Some(pool) = &self.pool else { return Vec::new() };

        let rows = match sqlx::query("SELECT trade_id, state FROM active_trades")
            .fetch_all(pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "active trade load failed");
                return Vec::new();
            }
        };

        let mut trades = Vec::new();
        for row in rows {
            let trade_id: String = row.try_get("trade_id").unwrap_or_default();
            let state: String = row.try_get("state").unwrap_or_default();
            match serde_json::from_str::<Trade>(&state) {
                Ok(trade) => trades.push(trade),
                Err(e) => error!(trade_id, error = %e, "corrupt trade snapshot skipped"),
            }
        }
        trades
    }

    pub async fn clear_active_trades(&self) -> u64 {
        let Some(pool) = &self.pool else { return 0 };

        match sqlx::query("DELETE FROM active_trades").execute(pool).await {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                error!(error = %e, "active trade clear failed");
                0
            }
        }
    }

    // =========================================================================
    // Daily equity
    // =========================================================================

    /// Accumulate a close into today's equity row.
    pub async fn record_daily_equity(
        &self,
        date: &str,
        equity: f64,
        pnl_delta: f64,
        win_delta: i64,
        loss_delta: i64,
    ) -> bool {
        let Some(pool) = &self.pool else { return false };

        let result = sqlx::query(
            "INSERT INTO daily_equity (date, equity, daily_pnl, wins, losses)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(date) DO UPDATE SET
                equity=excluded.equity,
                daily_pnl=daily_equity.daily_pnl + excluded.daily_pnl,
                wins=daily_equity.wins + excluded.wins,
                losses=daily_equity.losses + excluded.losses",
        )
        .bind(date)
        .bind(equity)
        .bind(pnl_delta)
        .bind(win_delta)
        .bind(loss_delta)
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(date, error = %e, "daily equity update failed");
            return false;
        }
        true
    }

    pub async fn equity_history(&self, days: i64) -> Vec<DailyEquity> {
        let Some(pool) = &self.pool else { return Vec::new() };

        let rows = match sqlx::query(
            "SELECT date, equity, daily_pnl, wins, losses FROM daily_equity
             ORDER BY date DESC LIMIT ?",
        )
        .bind(days)
        .fetch_all(pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "equity history read failed");
                return Vec::new();
            }
        };

        rows.iter()
            .map(|row| DailyEquity {
                date: row.try_get("date").unwrap_or_default(),
                equity: row.try_get("equity").unwrap_or(0.0),
                daily_pnl: row.try_get("daily_pnl").unwrap_or(0.0),
                wins: row.try_get("wins").unwrap_or(0),
                losses: row.try_get("losses").unwrap_or(0),
            })
            .collect()
    }

    // =========================================================================
    // Trend markers
    // =========================================================================

    pub async fn set_trend(&self, symbol: &str, direction: TrendDirection) -> bool {
        let Some(pool) = &self.pool else { return false };

        let result = sqlx::query(
            "INSERT INTO trend_markers (symbol, direction, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(symbol) DO UPDATE SET
                direction=excluded.direction, updated_at=excluded.updated_at",
        )
        .bind(symbol)
        .bind(direction.to_string())
        .bind(crate::types::unix_now())
        .execute(pool)
        .await;

        if let Err(e) = result {
            error!(symbol, error = %e, "trend marker save failed");
            return false;
        }
        true
    }

    pub async fn get_trend(&self, symbol: &str) -> Option<TrendDirection> {
        let Some(pool) = &self.pool else { return None };

        let row = sqlx::query("SELECT direction FROM trend_markers WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(pool)
            .await
            .map_err(|e| error!(symbol, error = %e, "trend marker read failed"))
            .ok()??;

        TrendDirection::parse(&row.try_get::<String, _>("direction").ok()?)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::ZoneSource;

    async fn test_store() -> Store {
        let store = Store::connect("sqlite::memory:").await;
        assert!(store.enabled());
        store.init().await;
        store
    }

    fn closed(trade_id: &str, symbol: &str, opened_at: f64, closed_at: f64) -> ClosedTrade {
        ClosedTrade {
            trade_id: trade_id.into(),
            symbol: symbol.into(),
            side: Side::Long,
            entry_price: 100.0,
            avg_price: 100.0,
            close_price: 103.0,
            total_qty: 8.0,
            total_margin: 40.0,
            realized_pnl: 12.0,
            max_dca_reached: 0,
            tps_hit: 4,
            close_reason: "Trailing stop".into(),
            opened_at,
            closed_at,
            signal_leverage: 50,
            equity_at_entry: 2400.0,
            equity_at_close: 2412.0,
            trail_pnl_pct: 5.0,
        }
    }

    #[tokio::test]
    async fn disabled_store_is_noop() {
        let store = Store::connect("").await;
        assert!(!store.enabled());
        assert!(store.get_zone("FOOUSDT").await.is_none());
        assert!(!store.save_closed_trade(&closed("t", "FOOUSDT", 1.0, 2.0)).await);
        assert!(store.load_active_trades().await.is_empty());
    }

    #[tokio::test]
    async fn zone_roundtrip() {
        let store = test_store().await;
        let zones = CoinZones {
            symbol: "FOOUSDT".into(),
            s1: 93.5,
            s2: 91.0,
            s3: 89.0,
            r1: 105.0,
            r2: 108.0,
            r3: 111.0,
            updated_at: 1_712_000_000.0,
            source: ZoneSource::External,
        };
        assert!(store.upsert_zone(&zones).await);

        let back = store.get_zone("FOOUSDT").await.unwrap();
        assert_eq!(back.s1, 93.5);
        assert_eq!(back.r3, 111.0);
        assert_eq!(back.source, ZoneSource::External);

        // Upsert overwrites.
        let mut updated = zones.clone();
        updated.s1 = 94.0;
        assert!(store.upsert_zone(&updated).await);
        assert_eq!(store.get_zone("FOOUSDT").await.unwrap().s1, 94.0);
        assert_eq!(store.all_zones().await.len(), 1);
    }

    #[tokio::test]
    async fn closed_trade_idempotent_on_trade_id() {
        let store = test_store().await;
        let first = closed("t1", "FOOUSDT", 1000.0, 2000.0);
        assert!(store.save_closed_trade(&first).await);

        // A replay with a different PnL must update the close fields but
        // never opened_at.
        let mut replay = first.clone();
        replay.realized_pnl = 10.5;
        replay.opened_at = 999.0;
        replay.close_reason = "Exchange sync".into();
        assert!(store.save_closed_trade(&replay).await);

        let rows = store.recent_trades(10).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].realized_pnl, 10.5);
        assert_eq!(rows[0].close_reason, "Exchange sync");
        assert_eq!(rows[0].opened_at, 1000.0);
    }

    #[tokio::test]
    async fn journal_dedup_lookups() {
        let store = test_store().await;
        store
            .save_closed_trade(&closed("t1", "FOOUSDT", 1000.0, 2000.0))
            .await;

        assert!(store.has_trade_near_open("FOOUSDT", 1030.0, 60.0).await);
        assert!(!store.has_trade_near_open("FOOUSDT", 1100.0, 60.0).await);
        assert!(store.has_trade_near_close("FOOUSDT", 1990.0, 60.0).await);
        assert!(store.has_trade_covering("FOOUSDT", 1500.0).await);
        assert!(!store.has_trade_covering("FOOUSDT", 2500.0).await);
        assert!(!store.has_trade_covering("BARUSDT", 1500.0).await);
    }

    #[tokio::test]
    async fn active_trade_snapshot_roundtrip() {
        let store = test_store().await;

        let trade: Trade = serde_json::from_value(serde_json::json!({
            "trade_id": "FOOUSDT_1712000000_1",
            "symbol": "FOOUSDT",
            "symbol_display": "FOO/USDT",
            "side": "long",
            "signal_entry": 100.0,
            "signal_leverage": 50,
            "leverage": 20,
            "dca_levels": [],
            "status": "open",
            "max_dca": 1,
            "opened_at": 1712000000.0
        }))
        .unwrap();

        assert!(store.save_active_trade(&trade).await);
        let loaded = store.load_active_trades().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].trade_id, trade.trade_id);

        assert!(store.delete_active_trade(&trade.trade_id).await);
        assert!(store.load_active_trades().await.is_empty());

        assert!(store.save_active_trade(&trade).await);
        assert_eq!(store.clear_active_trades().await, 1);
    }

    #[tokio::test]
    async fn daily_equity_accumulates() {
        let store = test_store().await;
        store.record_daily_equity("2025-01-01", 2400.0, 10.0, 1, 0).await;
        store.record_daily_equity("2025-01-01", 2390.0, -10.0, 0, 1).await;

        let history = store.equity_history(30).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].equity, 2390.0);
        assert!((history[0].daily_pnl - 0.0).abs() < 1e-9);
        assert_eq!(history[0].wins, 1);
        assert_eq!(history[0].losses, 1);
    }

    #[tokio::test]
    async fn trend_marker_roundtrip() {
        let store = test_store().await;
        assert!(store.get_trend("FOOUSDT").await.is_none());
        assert!(store.set_trend("FOOUSDT", TrendDirection::Up).await);
        assert_eq!(store.get_trend("FOOUSDT").await, Some(TrendDirection::Up));
        assert!(store.set_trend("FOOUSDT", TrendDirection::Down).await);
        assert_eq!(store.get_trend("FOOUSDT").await, Some(TrendDirection::Down));
    }

    #[tokio::test]
    async fn stats_aggregate() {
        let store = test_store().await;
        let mut a = closed("a", "FOOUSDT", 1.0, 2.0);
        a.realized_pnl = 12.0;
        let mut b = closed("b", "BARUSDT", 3.0, 4.0);
        b.realized_pnl = -5.0;
        let mut c = closed("c", "BAZUSDT", 5.0, 6.0);
        c.realized_pnl = 0.0;
        for rec in [&a, &b, &c] {
            store.save_closed_trade(rec).await;
        }

        let stats = store.trade_stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.breakeven, 1);
        assert!((stats.total_pnl - 7.0).abs() < 1e-9);
        assert_eq!(stats.best_trade, 12.0);
        assert_eq!(stats.worst_trade, -5.0);
    }
}
