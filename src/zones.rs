// =============================================================================
// Zone Source — support/resistance levels and DCA price snapping
// =============================================================================
//
// Three producers write zones, in priority order:
//   1. External push (primary): structured events from the charting feed.
//   2. Derived (fallback): swing highs/lows computed from candles, used only
//      when no fresh external zones exist.
//   3. Manual: direct overwrite via the admin endpoint.
//
// The snapping contract moves unfilled DCA limit prices onto the primary
// zone (S1 for longs, R1 for shorts) when the zone is on the favorable side
// of entry and far enough away to be worth averaging into.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bybit::models::Candle;
use crate::types::Side;

/// Where a zone snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneSource {
    External,
    Derived,
    Manual,
}

impl ZoneSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Derived => "derived",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "external" => Self::External,
            "manual" => Self::Manual,
            _ => Self::Derived,
        }
    }
}

/// Support/resistance snapshot for one symbol. S1/R1 are nearest to price,
/// S3/R3 deepest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinZones {
    pub symbol: String,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
    pub r1: f64,
    pub r2: f64,
    pub r3: f64,
    /// Unix seconds.
    pub updated_at: f64,
    pub source: ZoneSource,
}

impl CoinZones {
    pub fn age_minutes(&self, now: f64) -> f64 {
        (now - self.updated_at) / 60.0
    }

    /// Zones are usable iff at least one inner level is set and the snapshot
    /// is younger than `stale_minutes`.
    pub fn is_valid(&self, now: f64, stale_minutes: f64) -> bool {
        if self.s1 <= 0.0 && self.r1 <= 0.0 {
            return false;
        }
        self.age_minutes(now) < stale_minutes
    }

    /// The zone a given side averages into: S1 below for longs, R1 above for
    /// shorts.
    pub fn primary_zone(&self, side: Side) -> f64 {
        match side {
            Side::Long => self.s1,
            Side::Short => self.r1,
        }
    }

    /// Fill in missing support levels from the push feed's symmetry: the
    /// external zones are mirrored about `rz_avg`, so S_n = 2*rz_avg - R_n.
    /// Any level still missing falls back to the midpoint of its neighbours.
    pub fn complete_missing_levels(&mut self, rz_avg: f64) {
        if rz_avg > 0.0 {
            if self.s1 == 0.0 && self.r1 > 0.0 {
                self.s1 = 2.0 * rz_avg - self.r1;
            }
            if self.s2 == 0.0 && self.r2 > 0.0 {
                self.s2 = 2.0 * rz_avg - self.r2;
            }
            if self.s3 == 0.0 && self.r3 > 0.0 {
                self.s3 = 2.0 * rz_avg - self.r3;
            }
        }
        if self.s2 == 0.0 && self.s1 > 0.0 && self.s3 > 0.0 {
            self.s2 = (self.s1 + self.s3) / 2.0;
        }
        if self.r2 == 0.0 && self.r1 > 0.0 && self.r3 > 0.0 {
            self.r2 = (self.r1 + self.r3) / 2.0;
        }
    }
}

// =============================================================================
// Zone cache
// =============================================================================

/// In-memory zone cache fronting the store's `zones` table. Warmed on
/// startup; all readers snapshot through here.
#[derive(Default)]
pub struct ZoneBook {
    cache: RwLock<HashMap<String, CoinZones>>,
}

impl ZoneBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, symbol: &str) -> Option<CoinZones> {
        self.cache.read().get(symbol).cloned()
    }

    /// Unconditional overwrite (external push, manual set).
    pub fn insert(&self, zones: CoinZones) {
        self.cache.write().insert(zones.symbol.clone(), zones);
    }

    /// Install derived zones unless fresh external zones already exist.
    /// Returns whether the cache was updated.
    pub fn insert_derived(
        &self,
        zones: CoinZones,
        now: f64,
        external_fresh_minutes: f64,
    ) -> bool {
        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(&zones.symbol) {
            if existing.source == ZoneSource::External
                && existing.age_minutes(now) < external_fresh_minutes
            {
                debug!(symbol = %zones.symbol, "fresh external zones take priority");
                return false;
            }
        }
        cache.insert(zones.symbol.clone(), zones);
        true
    }

    /// Cache warmup from persisted rows on startup.
    pub fn warm(&self, rows: Vec<CoinZones>) {
        let count = rows.len();
        let mut cache = self.cache.write();
        for z in rows {
            cache.insert(z.symbol.clone(), z);
        }
        if count > 0 {
            info!(count, "zone cache warmed from store");
        }
    }

    pub fn snapshot(&self) -> Vec<CoinZones> {
        self.cache.read().values().cloned().collect()
    }
}

// =============================================================================
// Derived zones (swing highs/lows from candles)
// =============================================================================

/// Compute support/resistance zones from OHLC candles, oldest first.
///
/// A bar is a swing low (high) when its low (high) is the extreme of the
/// window of `lookback` bars on each side. The three most recent swing lows,
/// sorted descending, become S1..S3; swing highs, ascending, become R1..R3.
pub fn calc_swing_zones(
    symbol: &str,
    candles: &[Candle],
    lookback: usize,
    now: f64,
) -> Option<CoinZones> {
    if candles.len() < lookback * 2 + 1 {
        return None;
    }

    let mut swing_lows = Vec::new();
    let mut swing_highs = Vec::new();

    for i in lookback..candles.len() - lookback {
        let low = candles[i].low;
        let high = candles[i].high;

        let window = &candles[i - lookback..=i + lookback];
        if window.iter().all(|c| low <= c.low) {
            swing_lows.push(low);
        }
        if window.iter().all(|c| high >= c.high) {
            swing_highs.push(high);
        }
    }

    if swing_lows.is_empty() && swing_highs.is_empty() {
        return None;
    }

    // Keep the three most recent of each, then order S1 nearest price
    // (highest low) and R1 nearest price (lowest high).
    let mut recent_lows: Vec<f64> = swing_lows.iter().rev().take(3).copied().collect();
    let mut recent_highs: Vec<f64> = swing_highs.iter().rev().take(3).copied().collect();
    recent_lows.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    recent_highs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let pick = |v: &[f64], i: usize| v.get(i).copied().unwrap_or(0.0);

    Some(CoinZones {
        symbol: symbol.to_string(),
        s1: pick(&recent_lows, 0),
        s2: pick(&recent_lows, 1),
        s3: pick(&recent_lows, 2),
        r1: pick(&recent_highs, 0),
        r2: pick(&recent_highs, 1),
        r3: pick(&recent_highs, 2),
        updated_at: now,
        source: ZoneSource::Derived,
    })
}

// =============================================================================
// DCA snapping
// =============================================================================

/// Price provenance for one DCA slot after snapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapSource {
    Entry,
    Fixed,
    Zone,
    /// Slot already filled; price is untouched and the zone is not consumed.
    Filled,
}

impl SnapSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Fixed => "fixed",
            Self::Zone => "zone",
            Self::Filled => "filled",
        }
    }
}

/// Compute DCA limit prices for every slot, snapping at most one unfilled
/// slot onto the primary zone.
///
/// * Index 0 is always `(entry, Entry)`.
/// * A snap happens iff the zone sits on the favorable side of entry (below
///   for longs, above for shorts) and at least `snap_min_pct` away from it.
/// * `filled_mask[i]` marks slots whose orders already filled; they keep
///   their fixed price, are tagged `Filled`, and do not consume the zone.
/// * `limit_buffer_pct` pushes the limit slightly deeper into the zone to
///   compensate for feed lag.
pub fn snap_dca_levels(
    entry: f64,
    spacing_pcts: &[f64],
    zones: Option<&CoinZones>,
    side: Side,
    snap_min_pct: f64,
    filled_mask: &[bool],
    limit_buffer_pct: f64,
) -> Vec<(f64, SnapSource)> {
    let mut results = vec![(entry, SnapSource::Entry)];

    let zone = zones.map(|z| z.primary_zone(side)).unwrap_or(0.0);
    let favorable = match side {
        Side::Long => zone > 0.0 && zone < entry,
        Side::Short => zone > entry,
    };
    let distance_pct = if entry > 0.0 {
        (zone - entry).abs() / entry * 100.0
    } else {
        0.0
    };
    let mut zone_available = favorable && distance_pct >= snap_min_pct;

    let snapped_price = match side {
        Side::Long => zone * (1.0 - limit_buffer_pct / 100.0),
        Side::Short => zone * (1.0 + limit_buffer_pct / 100.0),
    };

    for (i, pct) in spacing_pcts.iter().enumerate().skip(1) {
        let fixed = match side {
            Side::Long => entry * (1.0 - pct / 100.0),
            Side::Short => entry * (1.0 + pct / 100.0),
        };

        if filled_mask.get(i).copied().unwrap_or(false) {
            results.push((fixed, SnapSource::Filled));
            continue;
        }

        if zone_available {
            zone_available = false;
            results.push((snapped_price, SnapSource::Zone));
        } else {
            results.push((fixed, SnapSource::Fixed));
        }
    }

    results
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn zones(s1: f64, r1: f64, now: f64) -> CoinZones {
        CoinZones {
            symbol: "FOOUSDT".into(),
            s1,
            s2: 0.0,
            s3: 0.0,
            r1,
            r2: 0.0,
            r3: 0.0,
            updated_at: now,
            source: ZoneSource::External,
        }
    }

    #[test]
    fn validity_needs_levels_and_freshness() {
        let now = 1_000_000.0;
        let z = zones(93.5, 0.0, now);
        assert!(z.is_valid(now, 120.0));
        assert!(!z.is_valid(now + 121.0 * 60.0, 120.0));
        let empty = zones(0.0, 0.0, now);
        assert!(!empty.is_valid(now, 120.0));
    }

    #[test]
    fn symmetry_completes_missing_supports() {
        let mut z = CoinZones {
            symbol: "FOOUSDT".into(),
            s1: 95.0,
            s2: 0.0,
            s3: 0.0,
            r1: 105.0,
            r2: 108.0,
            r3: 111.0,
            updated_at: 0.0,
            source: ZoneSource::External,
        };
        z.complete_missing_levels(100.0);
        // S_n = 2 * rz_avg - R_n
        assert!((z.s2 - 92.0).abs() < 1e-9);
        assert!((z.s3 - 89.0).abs() < 1e-9);
    }

    #[test]
    fn midpoint_fallback_without_rz_avg() {
        let mut z = CoinZones {
            symbol: "FOOUSDT".into(),
            s1: 96.0,
            s2: 0.0,
            s3: 90.0,
            r1: 0.0,
            r2: 0.0,
            r3: 0.0,
            updated_at: 0.0,
            source: ZoneSource::External,
        };
        z.complete_missing_levels(0.0);
        assert!((z.s2 - 93.0).abs() < 1e-9);
    }

    #[test]
    fn snap_replaces_fixed_price_when_zone_qualifies() {
        let now = 1_000_000.0;
        let z = zones(93.5, 0.0, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0],
            Some(&z),
            Side::Long,
            2.0,
            &[true, false],
            0.0,
        );
        assert_eq!(levels[0], (100.0, SnapSource::Entry));
        assert_eq!(levels[1].1, SnapSource::Zone);
        assert!((levels[1].0 - 93.5).abs() < 1e-9);
    }

    #[test]
    fn snap_requires_minimum_distance_from_entry() {
        let now = 1_000_000.0;
        // S1 only 1% below entry: too close to be worth averaging into.
        let z = zones(99.0, 0.0, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0],
            Some(&z),
            Side::Long,
            2.0,
            &[true, false],
            0.0,
        );
        assert_eq!(levels[1].1, SnapSource::Fixed);
        assert!((levels[1].0 - 95.0).abs() < 1e-9);
    }

    #[test]
    fn snap_ignores_zone_on_wrong_side() {
        let now = 1_000_000.0;
        // "Support" above entry is useless for a long.
        let z = zones(104.0, 0.0, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0],
            Some(&z),
            Side::Long,
            2.0,
            &[true, false],
            0.0,
        );
        assert_eq!(levels[1].1, SnapSource::Fixed);
    }

    #[test]
    fn zone_claims_only_first_unfilled_level() {
        let now = 1_000_000.0;
        let z = zones(92.0, 0.0, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0, 11.0],
            Some(&z),
            Side::Long,
            2.0,
            &[true, false, false],
            0.0,
        );
        assert_eq!(levels[1].1, SnapSource::Zone);
        assert_eq!(levels[2].1, SnapSource::Fixed);
        assert!((levels[2].0 - 89.0).abs() < 1e-9);
    }

    #[test]
    fn filled_levels_keep_price_and_do_not_consume_zone() {
        let now = 1_000_000.0;
        let z = zones(88.0, 0.0, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0, 11.0],
            Some(&z),
            Side::Long,
            2.0,
            &[true, true, false],
            0.0,
        );
        assert_eq!(levels[1].1, SnapSource::Filled);
        // The zone passes over the filled slot and claims the next one.
        assert_eq!(levels[2].1, SnapSource::Zone);
        assert!((levels[2].0 - 88.0).abs() < 1e-9);
    }

    #[test]
    fn limit_buffer_pushes_deeper_into_zone() {
        let now = 1_000_000.0;
        let z = zones(93.5, 0.0, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0],
            Some(&z),
            Side::Long,
            2.0,
            &[true, false],
            0.2,
        );
        assert!((levels[1].0 - 93.5 * 0.998).abs() < 1e-9);

        let z = zones(0.0, 106.5, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0],
            Some(&z),
            Side::Short,
            2.0,
            &[true, false],
            0.2,
        );
        assert!((levels[1].0 - 106.5 * 1.002).abs() < 1e-9);
    }

    #[test]
    fn short_side_snaps_to_resistance() {
        let now = 1_000_000.0;
        let z = zones(90.0, 106.0, now);
        let levels = snap_dca_levels(
            100.0,
            &[0.0, 5.0],
            Some(&z),
            Side::Short,
            2.0,
            &[true, false],
            0.0,
        );
        assert_eq!(levels[1].1, SnapSource::Zone);
        assert!((levels[1].0 - 106.0).abs() < 1e-9);
    }

    #[test]
    fn swing_zones_from_synthetic_candles() {
        // A saw-tooth with clear local extremes every 10 bars.
        let mut candles = Vec::new();
        for i in 0..100u32 {
            let base = 100.0 + 5.0 * ((i as f64) / 10.0 * std::f64::consts::PI).sin();
            candles.push(Candle {
                start: i as i64 * 900_000,
                open: base - 0.5,
                high: base + 1.0,
                low: base - 1.0,
                close: base + 0.5,
                volume: 0.0,
            });
        }
        let z = calc_swing_zones("FOOUSDT", &candles, 5, 1_000_000.0).unwrap();
        assert!(z.s1 > 0.0);
        assert!(z.r1 > 0.0);
        assert!(z.r1 > z.s1);
        // S1 nearest to price: descending order of the recent swing lows.
        assert!(z.s2 == 0.0 || z.s1 >= z.s2);
        assert!(z.r2 == 0.0 || z.r1 <= z.r2);
        assert_eq!(z.source, ZoneSource::Derived);
    }

    #[test]
    fn swing_zones_need_enough_bars() {
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle {
                start: i,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
            })
            .collect();
        assert!(calc_swing_zones("X", &candles, 5, 0.0).is_none());
    }
}
