/// Component A — Exchange Client (§4.A).
///
/// Talks directly to the exchange's public market-data endpoints over
/// `reqwest` rather than through the `binance` crate (see DESIGN.md): the
/// rate-limit tripwire needs the raw HTTP status code of every response,
/// which a higher-level client does not reliably expose.
use crate::model::{Candle, FIVE_MINUTES_MS};
use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Positional index of the fields we consume from a kline array, per §6:
/// `[openTime_ms, open, high, low, close, volume, closeTime_ms, quoteVolume, ...]`.
mod kline_field {
    pub const OPEN_TIME: usize = 0;
    pub const OPEN: usize = 1;
    pub const HIGH: usize = 2;
    pub const LOW: usize = 3;
    pub const CLOSE: usize = 4;
    pub const QUOTE_VOLUME: usize = 7;
}

pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    quote_suffix: String,
    exclude_symbols: HashSet<String>,
    request_interval: Duration,
    /// Process-wide one-way latch (§5, §7): once engaged by a 429/418, every
    /// subsequent public call short-circuits without network I/O until an
    /// operator calls `reset_rate_limit`.
    rate_limited: Arc<AtomicBool>,
}

impl ExchangeClient {
    pub fn new(
        base_url: impl Into<String>,
        quote_suffix: impl Into<String>,
        exclude_symbols: impl IntoIterator<Item = String>,
        request_interval: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            base_url: base_url.into(),
            quote_suffix: quote_suffix.into(),
            exclude_symbols: exclude_symbols.into_iter().map(|s| s.to_uppercase()).collect(),
            request_interval,
            rate_limited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::SeqCst)
    }

    /// Operator action: clears the latch (§7, no automatic recovery).
    pub fn reset_rate_limit(&self) {
        self.rate_limited.store(false, Ordering::SeqCst);
    }

    /// `GET /fapi/v1/ticker/24hr`, filtered to symbols ending in the
    /// configured quote suffix, minus the exclusion set (§4.A).
    pub async fn list_active_symbols(&self) -> Result<Vec<String>> {
        if self.is_rate_limited() {
            return Ok(Vec::new());
        }

        let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
        let response = self.http.get(&url).send().await.context("ticker request failed")?;

        if self.latch_if_rate_limited(response.status()) {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(anyhow!("ticker endpoint returned {}", response.status()));
        }

        let body: Vec<Value> = response.json().await.context("ticker body not JSON")?;
        let symbols = body
            .into_iter()
            .filter_map(|v| v.get("symbol").and_then(Value::as_str).map(str::to_uppercase))
            .filter(|symbol| {
                symbol.ends_with(self.quote_suffix.as_str())
                    && !self.exclude_symbols.contains(symbol)
            })
            .collect();

        Ok(symbols)
    }

    /// Fetches the most recent *closed* five-minute candle for `symbol`.
    pub async fn fetch_latest_closed_candle(&self, symbol: &str) -> Result<Option<Candle>> {
        if self.is_rate_limited() {
            return Ok(None);
        }

        // Two candles so we can discard a possibly-still-open final one.
        let candles = self.fetch_klines(symbol, None, None, 2).await?;
        Ok(candles.into_iter().next())
    }

    /// Fetches one page of candles in `[start_ms, end_ms]`, at most `limit`.
    pub async fn fetch_candle_range(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u16,
    ) -> Result<Vec<Candle>> {
        if self.is_rate_limited() {
            return Ok(Vec::new());
        }
        self.fetch_klines(symbol, Some(start_ms), Some(end_ms), limit).await
    }

    /// Pages forward from `start_ms` to `end_ms`, advancing the window by
    /// `last_candle.bucket_start_ms + 5 min` each time, sleeping
    /// `request_interval` between pages, stopping on an empty batch or once
    /// the window is exhausted (§4.A).
    pub async fn fetch_candle_range_paged(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        page_limit: u16,
    ) -> Result<Vec<Candle>> {
        let mut out = Vec::new();
        let mut cursor = start_ms;

        loop {
            if self.is_rate_limited() || cursor > end_ms {
                break;
            }

            let batch = self
                .fetch_klines(symbol, Some(cursor), Some(end_ms), page_limit)
                .await?;

            if batch.is_empty() {
                break;
            }

            let last_bucket = batch.last().map(|c| c.bucket_start_ms).unwrap_or(cursor);
            out.extend(batch);
            cursor = last_bucket + FIVE_MINUTES_MS;

            if cursor > end_ms {
                break;
            }
            tokio::time::sleep(self.request_interval).await;
        }

        Ok(out)
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u16,
    ) -> Result<Vec<Candle>> {
        if self.is_rate_limited() {
            return Ok(Vec::new());
        }

        let mut query = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), "5m".to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(s) = start_ms {
            query.push(("startTime".to_string(), s.to_string()));
        }
        if let Some(e) = end_ms {
            query.push(("endTime".to_string(), e.to_string()));
        }

        let url = format!("{}/fapi/v1/klines", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("klines request failed for {symbol}"))?;

        if self.latch_if_rate_limited(response.status()) {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(anyhow!(
                "klines endpoint returned {} for {symbol}",
                response.status()
            ));
        }

        let rows: Vec<Value> = response.json().await.context("klines body not JSON")?;
        let candles = rows
            .iter()
            .filter_map(|row| parse_kline_row(symbol, row))
            .collect();

        Ok(candles)
    }

    /// Latches the tripwire on 429/418 and reports whether it fired.
    fn latch_if_rate_limited(&self, status: reqwest::StatusCode) -> bool {
        if status.as_u16() == 429 || status.as_u16() == 418 {
            self.rate_limited.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }
}

fn parse_kline_row(symbol: &str, row: &Value) -> Option<Candle> {
    let arr = row.as_array()?;
    let open_time = arr.get(kline_field::OPEN_TIME)?.as_i64()?;
    let open = parse_numeric_field(arr.get(kline_field::OPEN)?)?;
    let high = parse_numeric_field(arr.get(kline_field::HIGH)?)?;
    let low = parse_numeric_field(arr.get(kline_field::LOW)?)?;
    let close = parse_numeric_field(arr.get(kline_field::CLOSE)?)?;
    let quote_volume = parse_numeric_field(arr.get(kline_field::QUOTE_VOLUME)?)?;

    let candle = Candle {
        symbol: symbol.to_string(),
        bucket_start_ms: open_time,
        open,
        high,
        low,
        close,
        quote_volume,
    };
    candle.is_bucket_aligned().then_some(candle)
}

fn parse_numeric_field(value: &Value) -> Option<f64> {
    value.as_str().and_then(|s| s.parse().ok()).or_else(|| value.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_kline_row_positional_fields() {
        let row = json!([
            1_700_000_100_000i64,
            "100.5",
            "105.25",
            "99.0",
            "102.1",
            "123.4",
            1_700_000_399_999i64,
            "5000.5",
            42,
            "10.0",
            "20.0",
            "0"
        ]);

        let candle = parse_kline_row("AAAUSDT", &row).unwrap();
        assert_eq!(candle.symbol, "AAAUSDT");
        assert_eq!(candle.bucket_start_ms, 1_700_000_100_000);
        assert_eq!(candle.open, 100.5);
        assert_eq!(candle.high, 105.25);
        assert_eq!(candle.low, 99.0);
        assert_eq!(candle.close, 102.1);
        assert_eq!(candle.quote_volume, 5000.5);
    }

    #[test]
    fn rejects_malformed_row() {
        let row = json!(["not enough fields"]);
        assert!(parse_kline_row("AAAUSDT", &row).is_none());
    }

    #[test]
    fn rejects_row_not_aligned_to_five_minutes() {
        let row = json!([
            1_700_000_100_001i64,
            "100.5", "105.25", "99.0", "102.1", "123.4",
            1_700_000_399_999i64, "5000.5", 42, "10.0", "20.0", "0"
        ]);
        assert!(parse_kline_row("AAAUSDT", &row).is_none());
    }
}
