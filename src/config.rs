/// Runtime configuration (§6 "Configuration" plus the ambient process knobs
/// SPEC_FULL.md §4.I adds: DB path, HTTP bind address, tick offset).
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// How many days of history a fresh database backfills on first start.
    pub backfill_days: i64,
    /// Semaphore permits for the backfill orchestrator's per-symbol workers.
    pub backfill_concurrency: usize,
    pub exchange_base_url: String,
    /// Throttle between successive pages of one symbol's backfill.
    pub request_interval_ms: u64,
    pub exclude_symbols: Vec<String>,
    pub quote_suffix: String,
    pub db_path: String,
    pub http_bind: String,
    pub http_port: u16,
    /// Seconds past the five-minute mark the live tick fires, to give the
    /// exchange time to finalize the just-closed bucket.
    pub tick_offset_secs: u32,
    /// Semaphore permits for the live tick's per-symbol fetch fan-out.
    pub live_tick_concurrency: usize,
    /// IANA zone used when a query's `timezone` parameter is omitted.
    pub default_timezone: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backfill_days: 7,
            backfill_concurrency: 5,
            exchange_base_url: "https://fapi.binance.com".to_string(),
            request_interval_ms: 250,
            exclude_symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            quote_suffix: "USDT".to_string(),
            db_path: "breadth_index.db".to_string(),
            http_bind: "127.0.0.1".to_string(),
            http_port: 8080,
            tick_offset_secs: 10,
            live_tick_concurrency: 12,
            default_timezone: "Asia/Shanghai".to_string(),
        }
    }
}

impl Config {
    /// Loads configuration from the environment, falling back to the
    /// defaults above for anything unset. Reads a local `.env` first, the
    /// way `examples/Zuytan-rustrade` does with `dotenvy`.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        Self {
            backfill_days: env_i64("BACKFILL_DAYS", defaults.backfill_days),
            backfill_concurrency: env_usize("BACKFILL_CONCURRENCY", defaults.backfill_concurrency),
            exchange_base_url: std::env::var("EXCHANGE_BASE_URL")
                .unwrap_or(defaults.exchange_base_url),
            request_interval_ms: env_u64("REQUEST_INTERVAL_MS", defaults.request_interval_ms),
            exclude_symbols: std::env::var("EXCLUDE_SYMBOLS")
                .map(|v| v.split(',').map(|s| s.trim().to_uppercase()).collect())
                .unwrap_or(defaults.exclude_symbols),
            quote_suffix: std::env::var("QUOTE_SUFFIX").unwrap_or(defaults.quote_suffix),
            db_path: std::env::var("DB_PATH").unwrap_or(defaults.db_path),
            http_bind: std::env::var("HTTP_BIND").unwrap_or(defaults.http_bind),
            http_port: env_u16("HTTP_PORT", defaults.http_port),
            tick_offset_secs: env_u32("TICK_OFFSET_SECS", defaults.tick_offset_secs),
            live_tick_concurrency: env_usize(
                "LIVE_TICK_CONCURRENCY",
                defaults.live_tick_concurrency,
            ),
            default_timezone: std::env::var("DEFAULT_TIMEZONE").unwrap_or(defaults.default_timezone),
        }
    }

    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
