/// Component H — Uptrend Engine, one-sided wave segmentation (§4.H).
use crate::context::Context;
use crate::distribution::{adaptive_step, bucket_label};
use crate::error::QueryError;
use crate::model::Candle;
use crate::persistence::Persistence;
use crate::time_spec::TimeSpec;
use chrono::Utc;
use moka::future::Cache;
use serde::Serialize;
use std::time::Duration;

/// One emitted or still-open uptrend leg for a single symbol.
#[derive(Debug, Clone, Serialize)]
pub struct Wave {
    pub symbol: String,
    pub start_time_ms: i64,
    pub peak_time_ms: i64,
    pub start_price: f64,
    pub peak_price: f64,
    /// `(peak_price - start_price) / start_price * 100`.
    pub pct: f64,
    /// True when the wave was still running at the end of the scanned
    /// window rather than terminated by giveback or sideways drift.
    pub ongoing: bool,
}

/// One bin of the adaptive-step uptrend-magnitude histogram.
#[derive(Debug, Clone, Serialize)]
pub struct UptrendBucket {
    pub range: String,
    pub count: usize,
    pub ongoing_count: usize,
    pub waves: Vec<Wave>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UptrendResult {
    /// Total waves found across every symbol, qualifying and ongoing alike.
    pub total_coins: usize,
    pub ongoing_count: usize,
    pub avg_uptrend: f64,
    pub max_uptrend: f64,
    pub distribution: Vec<UptrendBucket>,
    /// All waves, sorted descending by `pct`.
    pub all_coins_ranking: Vec<Wave>,
}

/// Cache key: the resolved, bucket-aligned time range plus the three
/// knobs that change wave segmentation, each float reduced to its bit
/// pattern so the key can derive `Eq`/`Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    aligned_t0_ms: i64,
    aligned_t1_ms: i64,
    keep_ratio_bits: u64,
    no_new_high_candles: u32,
    min_uptrend_bits: u64,
}

fn float_bits(v: f64) -> u64 {
    v.to_bits()
}

/// Keyed by `(aligned_t0, aligned_t1, k, N, m)`, at most 10 entries, 5-minute
/// TTL, invalidated whenever the Live Collector commits a new IndexRow
/// (§4.H "Cache", §9 "Caching").
#[derive(Clone)]
pub struct UptrendCache {
    inner: Cache<CacheKey, UptrendResult>,
}

impl UptrendCache {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(10)
                .time_to_live(Duration::from_secs(5 * 60))
                .build(),
        }
    }

    pub async fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

impl Default for UptrendCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UptrendParams {
    /// Retracement fraction `k`: a close giving back more than `1 - k` of
    /// the wave's gain from its peak ends the wave.
    pub keep_ratio: f64,
    /// Candle count `N`: this many candles in a row with no new high also
    /// ends the wave (sideways drift).
    pub no_new_high_candles: u32,
    /// Minimum `pct` `m` a terminated wave must reach to be emitted.
    pub min_uptrend_pct: f64,
}

/// Resolves a `TimeSpec`, serves from cache when possible, otherwise runs
/// the per-symbol scans and assembles the response (§4.H). `Ok(None)` is
/// §7's "missing inputs" case: no candles yet in `[t0, t1]` because backfill
/// has not reached this window; that case is never cached.
pub async fn query(
    ctx: &Context,
    time_spec: TimeSpec,
    params: UptrendParams,
) -> Result<Option<UptrendResult>, QueryError> {
    let (t0, t1) = time_spec.normalize(Utc::now(), &ctx.config.default_timezone)?;
    let key = CacheKey {
        aligned_t0_ms: t0.timestamp_millis(),
        aligned_t1_ms: t1.timestamp_millis(),
        keep_ratio_bits: float_bits(params.keep_ratio),
        no_new_high_candles: params.no_new_high_candles,
        min_uptrend_bits: float_bits(params.min_uptrend_pct),
    };

    if let Some(cached) = ctx.uptrend_cache.inner.get(&key).await {
        return Ok(Some(cached));
    }

    let result = compute(&ctx.persistence, t0.timestamp_millis(), t1.timestamp_millis(), &params)?;
    if let Some(ref result) = result {
        ctx.uptrend_cache.inner.insert(key, result.clone()).await;
    }
    Ok(result)
}

/// Pure computation over a resolved `[t0, t1]`, separated from `query` so
/// it can be driven directly in tests without a `Context`.
pub fn compute(
    persistence: &Persistence,
    t0_ms: i64,
    t1_ms: i64,
    params: &UptrendParams,
) -> Result<Option<UptrendResult>, QueryError> {
    let candles = persistence.candles_in_range_all(t0_ms, t1_ms)?;
    if candles.is_empty() {
        return Ok(None);
    }

    let mut waves = Vec::new();
    let mut symbol_start = 0usize;
    while symbol_start < candles.len() {
        let symbol = candles[symbol_start].symbol.clone();
        let mut symbol_end = symbol_start;
        while symbol_end < candles.len() && candles[symbol_end].symbol == symbol {
            symbol_end += 1;
        }
        let series = &candles[symbol_start..symbol_end];
        waves.extend(scan_symbol(&symbol, series, params));
        symbol_start = symbol_end;
    }

    waves.sort_by(|a, b| b.pct.partial_cmp(&a.pct).unwrap());

    let ongoing_count = waves.iter().filter(|w| w.ongoing).count();
    let avg_uptrend = if waves.is_empty() {
        0.0
    } else {
        waves.iter().map(|w| w.pct).sum::<f64>() / waves.len() as f64
    };
    let max_uptrend = waves.iter().map(|w| w.pct).fold(0.0_f64, f64::max);

    let distribution = bucket_waves(&waves);

    Ok(Some(UptrendResult {
        total_coins: waves.len(),
        ongoing_count,
        avg_uptrend,
        max_uptrend,
        distribution,
        all_coins_ranking: waves,
    }))
}

/// Runs the §4.H state machine over one symbol's time-ordered candles.
fn scan_symbol(symbol: &str, series: &[Candle], params: &UptrendParams) -> Vec<Wave> {
    let mut waves = Vec::new();
    if series.is_empty() {
        return waves;
    }

    let mut in_wave = false;
    let mut ws_price = 0.0;
    let mut ws_time = 0i64;
    let mut peak_price = 0.0;
    let mut peak_time = 0i64;
    let mut wave_lowest_low = 0.0;
    let mut no_new_high = 0u32;
    let mut peak_index = 0usize;

    for (i, candle) in series.iter().enumerate() {
        let t = candle.bucket_start_ms;

        if !in_wave {
            ws_price = candle.low;
            wave_lowest_low = candle.low;
            ws_time = t;
            peak_price = candle.high;
            peak_time = t;
            peak_index = i;
            no_new_high = 0;
            in_wave = true;
            continue;
        }

        let made_new_high = candle.high > peak_price;
        if made_new_high {
            peak_price = candle.high;
            peak_time = t;
            peak_index = i;
            no_new_high = 0;
        } else {
            no_new_high += 1;
        }

        if candle.low < wave_lowest_low {
            // Break-below: invalidate the wave, restart here. No emission.
            ws_price = candle.low;
            wave_lowest_low = candle.low;
            ws_time = t;
            peak_price = candle.high;
            peak_time = t;
            peak_index = i;
            no_new_high = 0;
            continue;
        }

        let denom = peak_price - ws_price;
        let pr = if denom == 0.0 { 1.0 } else { (candle.close - ws_price) / denom };

        let giveback = !made_new_high && pr < params.keep_ratio && peak_price > ws_price;
        let sideways = no_new_high >= params.no_new_high_candles;

        if giveback || sideways {
            emit_if_qualifying(&mut waves, symbol, ws_time, peak_time, ws_price, peak_price, params, false);

            // Restart rule: back-scan strictly after peak_time up to and
            // including the current candle for the new start low (§4.H step
            // 5, §9 "restart by back-scanning").
            let (new_start_low, new_start_time) = series[(peak_index + 1)..=i]
                .iter()
                .min_by(|a, b| a.low.partial_cmp(&b.low).unwrap())
                .map(|c| (c.low, c.bucket_start_ms))
                .unwrap_or((candle.low, t));

            ws_price = new_start_low;
            wave_lowest_low = new_start_low;
            ws_time = new_start_time;
            peak_price = candle.high;
            peak_time = t;
            peak_index = i;
            no_new_high = 0;
        }
    }

    if in_wave && peak_price > ws_price {
        let ongoing = no_new_high < params.no_new_high_candles;
        emit_if_qualifying(&mut waves, symbol, ws_time, peak_time, ws_price, peak_price, params, ongoing);
    }

    waves
}

#[allow(clippy::too_many_arguments)]
fn emit_if_qualifying(
    waves: &mut Vec<Wave>,
    symbol: &str,
    ws_time: i64,
    peak_time: i64,
    ws_price: f64,
    peak_price: f64,
    params: &UptrendParams,
    ongoing: bool,
) {
    if ws_time == peak_time {
        return;
    }
    let pct = (peak_price - ws_price) / ws_price * 100.0;
    if pct < params.min_uptrend_pct {
        return;
    }
    waves.push(Wave {
        symbol: symbol.to_string(),
        start_time_ms: ws_time,
        peak_time_ms: peak_time,
        start_price: ws_price,
        peak_price,
        pct,
        ongoing,
    });
}

fn bucket_waves(waves: &[Wave]) -> Vec<UptrendBucket> {
    if waves.is_empty() {
        return Vec::new();
    }

    let min_value = waves.iter().map(|w| w.pct).fold(f64::INFINITY, f64::min);
    let max_value = waves.iter().map(|w| w.pct).fold(f64::NEG_INFINITY, f64::max);
    let step = adaptive_step(min_value, max_value);

    let grid_lo = (min_value / step).floor() * step;
    let grid_hi = (max_value / step).ceil() * step;
    let bucket_count = (((grid_hi - grid_lo) / step).round() as i64).max(1);

    let mut buckets: Vec<Vec<Wave>> = vec![Vec::new(); bucket_count as usize];
    for wave in waves {
        let mut idx = ((wave.pct - grid_lo) / step).floor() as i64;
        idx = idx.clamp(0, bucket_count - 1);
        buckets[idx as usize].push(wave.clone());
    }

    buckets
        .into_iter()
        .enumerate()
        .filter(|(_, members)| !members.is_empty())
        .map(|(idx, mut members)| {
            let lo = grid_lo + idx as f64 * step;
            let hi = lo + step;
            members.sort_by(|a, b| b.pct.partial_cmp(&a.pct).unwrap());
            let ongoing_count = members.iter().filter(|w| w.ongoing).count();
            UptrendBucket { range: bucket_label(lo, hi, step), count: members.len(), ongoing_count, waves: members }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle_ohlc(t: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { symbol: "AAAUSDT".to_string(), bucket_start_ms: t, open, high, low, close, quote_volume: 1.0 }
    }

    fn default_params() -> UptrendParams {
        UptrendParams { keep_ratio: 0.75, no_new_high_candles: 6, min_uptrend_pct: 1.0 }
    }

    #[test]
    fn monotonic_rise_emits_one_ongoing_wave() {
        let series = vec![
            candle_ohlc(0, 100.0, 100.0, 100.0, 100.0),
            candle_ohlc(300_000, 101.0, 102.0, 100.5, 101.5),
            candle_ohlc(600_000, 102.0, 104.0, 101.5, 103.5),
            candle_ohlc(900_000, 104.0, 107.0, 103.5, 106.0),
        ];
        let params = UptrendParams { min_uptrend_pct: 1.0, ..default_params() };

        let waves = scan_symbol("AAAUSDT", &series, &params);
        assert_eq!(waves.len(), 1);
        assert!(waves[0].ongoing);
        assert!(waves[0].peak_time_ms > waves[0].start_time_ms);
        assert!(waves[0].peak_price > waves[0].start_price);
    }

    #[test]
    fn s5_giveback_termination_matches_scenario() {
        // closes 100, 104, 108, 112, 108.5; highs/lows +-0.01 of close.
        let closes = [100.0, 104.0, 108.0, 112.0, 108.5];
        let series: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| candle_ohlc(i as i64 * FIVE_MIN, c, c + 0.01, c - 0.01, c))
            .collect();
        let params = UptrendParams { keep_ratio: 0.75, no_new_high_candles: 6, min_uptrend_pct: 1.0 };

        let waves = scan_symbol("AAAUSDT", &series, &params);
        assert_eq!(waves.len(), 1);
        assert!((waves[0].pct - 12.0).abs() < 0.5);
    }

    #[test]
    fn s6_sideways_termination_matches_scenario() {
        let closes = [100.0, 105.0, 105.0, 105.0, 105.0, 105.0, 105.0, 105.0];
        let series: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| candle_ohlc(i as i64 * FIVE_MIN, c, c, c, c))
            .collect();
        let params = UptrendParams { keep_ratio: 0.75, no_new_high_candles: 6, min_uptrend_pct: 1.0 };

        let waves = scan_symbol("AAAUSDT", &series, &params);
        assert_eq!(waves.len(), 1);
        assert!((waves[0].pct - 5.0).abs() < 1e-6);
    }

    #[test]
    fn break_below_invalidates_and_restarts() {
        let series = vec![
            candle_ohlc(0, 100.0, 100.0, 100.0, 100.0),
            candle_ohlc(300_000, 101.0, 110.0, 101.0, 109.0),
            // Low drops below the wave's recorded lowest low (100.0).
            candle_ohlc(600_000, 90.0, 95.0, 90.0, 92.0),
            candle_ohlc(900_000, 93.0, 120.0, 92.0, 115.0),
        ];
        let params = UptrendParams { keep_ratio: 0.75, no_new_high_candles: 6, min_uptrend_pct: 1.0 };

        let waves = scan_symbol("AAAUSDT", &series, &params);
        // First leg (0 -> 110) is invalidated by the break-below; only the
        // restarted wave from the dip at t=600_000 should emit or continue.
        assert!(waves.iter().all(|w| w.start_time_ms >= 600_000));
    }

    const FIVE_MIN: i64 = 300_000;
}
