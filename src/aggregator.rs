/// Component D — Index Aggregator (§4.D).
///
/// Given a batch of candles sharing one `bucket_start` and the current
/// base-price map, computes one IndexRow. Pure, no I/O; shared by the
/// live-tick and backfill paths.
use crate::model::{Candle, IndexRow};
use std::collections::HashMap;

/// Returns `None` if no candle in the batch has a usable base price
/// (nothing to aggregate for this bucket).
pub fn aggregate_bucket(
    bucket_start_ms: i64,
    candles: &[Candle],
    base_prices: &HashMap<String, f64>,
) -> Option<IndexRow> {
    let mut pct_sum = 0.0;
    let mut total_volume = 0.0;
    let mut coin_count = 0i64;
    let mut up_count = 0i64;
    let mut down_count = 0i64;

    for candle in candles {
        let Some(&base) = base_prices.get(&candle.symbol) else { continue };
        if base <= 0.0 || candle.close <= 0.0 {
            continue;
        }

        let pct = (candle.close - base) / base * 100.0;
        pct_sum += pct;
        total_volume += candle.quote_volume;
        coin_count += 1;
        if pct > 0.0 {
            up_count += 1;
        } else if pct < 0.0 {
            down_count += 1;
        }
    }

    if coin_count == 0 {
        return None;
    }

    let index_value = pct_sum / coin_count as f64;
    let adr = if down_count > 0 { up_count as f64 / down_count as f64 } else { up_count as f64 };

    Some(IndexRow {
        bucket_start_ms,
        index_value,
        total_volume,
        coin_count,
        up_count,
        down_count,
        adr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(symbol: &str, close: f64, qv: f64) -> Candle {
        Candle { symbol: symbol.to_string(), bucket_start_ms: 0, open: close, high: close, low: close, close, quote_volume: qv }
    }

    #[test]
    fn computes_simple_mean_not_volume_weighted() {
        let candles = vec![candle("AAAUSDT", 110.0, 1000.0), candle("BBBUSDT", 90.0, 1.0)];
        let bases = HashMap::from([("AAAUSDT".to_string(), 100.0), ("BBBUSDT".to_string(), 100.0)]);

        let row = aggregate_bucket(300_000, &candles, &bases).unwrap();

        // +10% and -10% average to 0, regardless of the lopsided volumes.
        assert!((row.index_value - 0.0).abs() < 1e-9);
        assert_eq!(row.total_volume, 1001.0);
        assert_eq!(row.coin_count, 2);
        assert_eq!(row.up_count, 1);
        assert_eq!(row.down_count, 1);
        assert_eq!(row.adr, 1.0);
    }

    #[test]
    fn adr_falls_back_to_up_count_when_no_down() {
        let candles = vec![candle("AAAUSDT", 110.0, 1.0), candle("BBBUSDT", 120.0, 1.0)];
        let bases = HashMap::from([("AAAUSDT".to_string(), 100.0), ("BBBUSDT".to_string(), 100.0)]);

        let row = aggregate_bucket(0, &candles, &bases).unwrap();
        assert_eq!(row.down_count, 0);
        assert_eq!(row.adr, 2.0);
    }

    #[test]
    fn skips_symbols_without_base_or_nonpositive_price() {
        let candles = vec![
            candle("AAAUSDT", 110.0, 1.0),  // no base -> skipped
            candle("BBBUSDT", 100.0, 1.0),  // base <= 0 -> skipped
            candle("CCCUSDT", -5.0, 1.0),   // close <= 0 -> skipped
            candle("DDDUSDT", 100.0, 1.0),  // contributes
        ];
        let bases = HashMap::from([
            ("BBBUSDT".to_string(), 0.0),
            ("CCCUSDT".to_string(), 100.0),
            ("DDDUSDT".to_string(), 100.0),
        ]);

        let row = aggregate_bucket(0, &candles, &bases).unwrap();
        assert_eq!(row.coin_count, 1);
    }

    #[test]
    fn empty_contribution_yields_no_row() {
        let candles = vec![candle("AAAUSDT", 110.0, 1.0)];
        let bases = HashMap::new();
        assert!(aggregate_bucket(0, &candles, &bases).is_none());
    }
}
