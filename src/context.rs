/// Ambient Component J — shared process context (§9 "Global mutable state").
///
/// Bundles the three pieces of process-wide mutable state plus the handles
/// every component needs, so nothing is reached through a singleton: it is
/// built once in `main` and handed to every task and HTTP handler.
use crate::base_price::BasePriceRegistry;
use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::persistence::Persistence;
use crate::uptrend::UptrendCache;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub persistence: Persistence,
    pub base_prices: Arc<BasePriceRegistry>,
    pub exchange: Arc<ExchangeClient>,
    /// Set while the Backfill Orchestrator runs; the Live Collector skips
    /// its tick entirely while this is true (§4.F step 1).
    pub backfill_in_progress: Arc<AtomicBool>,
    pub uptrend_cache: UptrendCache,
}

impl Context {
    pub fn new(config: Config, persistence: Persistence) -> Self {
        let exchange = ExchangeClient::new(
            config.exchange_base_url.clone(),
            config.quote_suffix.clone(),
            config.exclude_symbols.clone(),
            config.request_interval(),
        );
        let base_prices = BasePriceRegistry::new(persistence.clone());

        Self {
            config: Arc::new(config),
            persistence,
            base_prices: Arc::new(base_prices),
            exchange: Arc::new(exchange),
            backfill_in_progress: Arc::new(AtomicBool::new(false)),
            uptrend_cache: UptrendCache::new(),
        }
    }
}
