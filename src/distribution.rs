/// Component G — Distribution Query, rise-distribution histogram (§4.G).
use crate::context::Context;
use crate::error::QueryError;
use crate::persistence::Persistence;
use crate::time_spec::TimeSpec;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct SymbolChange {
    pub symbol: String,
    /// Percent change from the base snapshot's open to the end snapshot's close.
    pub change_pct: f64,
    /// Best percent excursion reached anywhere in `[t0, t1]`, from the bucket high.
    pub max_change_pct: f64,
    /// Worst percent excursion reached anywhere in `[t0, t1]`, from the bucket low.
    pub min_change_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionBucket {
    pub range: String,
    pub count: usize,
    pub members: Vec<SymbolChange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionResult {
    pub total_coins: usize,
    pub up_count: usize,
    pub down_count: usize,
    pub distribution: Vec<DistributionBucket>,
    pub all_coins_ranking: Vec<SymbolChange>,
}

/// Resolves a `TimeSpec` and runs the distribution query (§4.G steps 1-6).
/// `Ok(None)` is §7's "missing inputs" case: no candles yet in `[t0, t1]`
/// because backfill has not reached this window.
pub async fn query(ctx: &Context, time_spec: TimeSpec) -> Result<Option<DistributionResult>, QueryError> {
    let (t0, t1) = time_spec.normalize(Utc::now(), &ctx.config.default_timezone)?;
    compute(&ctx.persistence, t0.timestamp_millis(), t1.timestamp_millis())
}

/// Pure computation over a resolved `[t0, t1]`, separated from `query` so it
/// can be driven directly in tests without a `Context`.
pub fn compute(
    persistence: &Persistence,
    t0_ms: i64,
    t1_ms: i64,
) -> Result<Option<DistributionResult>, QueryError> {
    let base_snapshot = persistence.earliest_candles_at_or_after(t0_ms)?;
    let end_snapshot = persistence.latest_candles_at_or_before(t1_ms)?;
    if base_snapshot.is_empty() || end_snapshot.is_empty() {
        return Ok(None);
    }
    let excursions = persistence.max_high_min_low_per_symbol(t0_ms, t1_ms)?;

    let base_by_symbol: HashMap<&str, f64> =
        base_snapshot.iter().map(|c| (c.symbol.as_str(), c.open)).collect();
    let end_by_symbol: HashMap<&str, f64> =
        end_snapshot.iter().map(|c| (c.symbol.as_str(), c.close)).collect();

    let mut changes = Vec::new();
    for (symbol, &base) in &base_by_symbol {
        let Some(&end) = end_by_symbol.get(symbol) else { continue };
        if base <= 0.0 || end <= 0.0 {
            continue;
        }
        let (max_high, min_low) = excursions.get(*symbol).copied().unwrap_or((end, end));

        changes.push(SymbolChange {
            symbol: symbol.to_string(),
            change_pct: (end - base) / base * 100.0,
            max_change_pct: (max_high - base) / base * 100.0,
            min_change_pct: (min_low - base) / base * 100.0,
        });
    }

    let up_count = changes.iter().filter(|c| c.change_pct > 0.0).count();
    let down_count = changes.iter().filter(|c| c.change_pct < 0.0).count();

    let mut all_coins_ranking = changes.clone();
    all_coins_ranking.sort_by(|a, b| b.change_pct.partial_cmp(&a.change_pct).unwrap());

    let distribution = bucket_by_adaptive_step(&changes, |c| c.change_pct);

    Ok(Some(DistributionResult {
        total_coins: changes.len(),
        up_count,
        down_count,
        distribution,
        all_coins_ranking,
    }))
}

/// Shared adaptive-step bucketing scheme (§4.G step 5, reused by §4.H).
pub fn adaptive_step(min_value: f64, max_value: f64) -> f64 {
    let range = max_value - min_value;
    if range <= 2.0 {
        0.2
    } else if range <= 5.0 {
        0.5
    } else if range <= 20.0 {
        1.0
    } else if range <= 50.0 {
        2.0
    } else {
        5.0
    }
}

pub fn bucket_label(lo: f64, hi: f64, step: f64) -> String {
    if step < 1.0 {
        format!("{lo:.1}%~{hi:.1}%")
    } else {
        format!("{lo:.0}%~{hi:.0}%")
    }
}

fn bucket_by_adaptive_step<T: Clone>(items: &[T], value_of: impl Fn(&T) -> f64) -> Vec<DistributionBucket>
where
    T: Into<SymbolChange>,
{
    if items.is_empty() {
        return Vec::new();
    }

    let min_value = items.iter().map(&value_of).fold(f64::INFINITY, f64::min);
    let max_value = items.iter().map(&value_of).fold(f64::NEG_INFINITY, f64::max);
    let step = adaptive_step(min_value, max_value);

    let grid_lo = (min_value / step).floor() * step;
    let grid_hi = (max_value / step).ceil() * step;

    let bucket_count = (((grid_hi - grid_lo) / step).round() as i64).max(1);
    let mut buckets: Vec<Vec<T>> = vec![Vec::new(); bucket_count as usize];

    for item in items {
        let value = value_of(item);
        let mut idx = ((value - grid_lo) / step).floor() as i64;
        idx = idx.clamp(0, bucket_count - 1);
        buckets[idx as usize].push(item.clone());
    }

    buckets
        .into_iter()
        .enumerate()
        .filter(|(_, members)| !members.is_empty())
        .map(|(idx, mut members)| {
            let lo = grid_lo + idx as f64 * step;
            let hi = lo + step;
            members.sort_by(|a, b| value_of(b).partial_cmp(&value_of(a)).unwrap());
            DistributionBucket {
                range: bucket_label(lo, hi, step),
                count: members.len(),
                members: members.into_iter().map(Into::into).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Candle;

    fn candle(symbol: &str, bucket_start_ms: i64, open: f64, close: f64, high: f64, low: f64) -> Candle {
        Candle { symbol: symbol.to_string(), bucket_start_ms, open, high, low, close, quote_volume: 1.0 }
    }

    #[test]
    fn adaptive_step_thresholds() {
        assert_eq!(adaptive_step(0.0, 2.0), 0.2);
        assert_eq!(adaptive_step(0.0, 5.0), 0.5);
        assert_eq!(adaptive_step(0.0, 20.0), 1.0);
        assert_eq!(adaptive_step(0.0, 50.0), 2.0);
        assert_eq!(adaptive_step(0.0, 51.0), 5.0);
    }

    #[test]
    fn s4_adaptive_bucketing_matches_scenario() {
        let persistence = Persistence::open_in_memory().unwrap();
        // base open = 100 for all; end closes produce {-0.3, 0.1, 0.4, 0.9}
        persistence
            .insert_candles_bulk(&[
                candle("AAAUSDT", 0, 100.0, 99.7, 100.0, 99.0),
                candle("BBBUSDT", 0, 100.0, 100.1, 100.5, 99.5),
                candle("CCCUSDT", 0, 100.0, 100.4, 100.5, 99.5),
                candle("DDDUSDT", 0, 100.0, 100.9, 101.0, 99.5),
            ])
            .unwrap();

        let result = compute(&persistence, 0, 0).unwrap().unwrap();
        assert_eq!(result.total_coins, 4);

        let labels: Vec<(String, usize)> =
            result.distribution.iter().map(|b| (b.range.clone(), b.count)).collect();
        assert_eq!(labels.len(), 4);
        for (_, count) in labels {
            assert_eq!(count, 1);
        }
    }

    #[test]
    fn single_instant_has_at_most_one_bucket() {
        let persistence = Persistence::open_in_memory().unwrap();
        persistence
            .insert_candles_bulk(&[candle("AAAUSDT", 0, 100.0, 100.0, 100.0, 100.0)])
            .unwrap();

        let result = compute(&persistence, 0, 0).unwrap().unwrap();
        assert!(result.distribution.len() <= 1);
    }

    #[test]
    fn missing_candles_is_none_not_a_zero_result() {
        let persistence = Persistence::open_in_memory().unwrap();
        assert!(compute(&persistence, 0, 300_000).unwrap().is_none());
    }
}
