/// Core data model shared by every component: the Candle, the IndexRow and
/// the BasePrice, plus the small invariants each one carries (§3).
use serde::{Deserialize, Serialize};

/// A five-minute OHLCV candle for one symbol.
///
/// Invariant: `low <= min(open, close) <= max(open, close) <= high`, and
/// `bucket_start_ms` is aligned to an exact multiple of five minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Perpetual futures symbol, e.g. `"BTCUSDT"`. Always upper-cased.
    pub symbol: String,
    /// Opening instant of the five-minute window, UTC milliseconds.
    pub bucket_start_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Quote-asset (USDT) volume traded during the bucket.
    pub quote_volume: f64,
}

impl Candle {
    /// True when the OHLC ordering invariant and volume sign hold.
    pub fn is_well_formed(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo && lo <= hi && hi <= self.high && self.quote_volume >= 0.0
    }

    /// True when `bucket_start_ms` falls exactly on a five-minute boundary.
    /// The exchange should only ever hand back aligned opening instants;
    /// this guards ingestion against a malformed or shifted kline row.
    pub fn is_bucket_aligned(&self) -> bool {
        self.bucket_start_ms % FIVE_MINUTES_MS == 0
    }
}

pub const FIVE_MINUTES_MS: i64 = 5 * 60 * 1000;

/// One aggregated index point for a single bucket (§3, §4.D).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    pub bucket_start_ms: i64,
    /// Simple (unweighted) mean of per-symbol percent change, in percent.
    pub index_value: f64,
    /// Sum of `quote_volume` across every contributing candle.
    pub total_volume: f64,
    /// Number of symbols that contributed to this row.
    pub coin_count: i64,
    pub up_count: i64,
    pub down_count: i64,
    /// Advance/decline ratio: `up_count / down_count`, or `up_count` when
    /// `down_count` is zero.
    pub adr: f64,
}

impl IndexRow {
    /// Contributing symbols whose change was exactly zero.
    pub fn zero_count(&self) -> i64 {
        self.coin_count - self.up_count - self.down_count
    }
}

/// The fixed per-symbol reference price (§3): set once, by whichever of
/// the Backfill Orchestrator or Live Collector observes the symbol first,
/// and held until the symbol leaves the active set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasePrice {
    pub symbol: String,
    pub price: f64,
    /// When this base was adopted, UTC milliseconds.
    pub created_at_ms: i64,
}
