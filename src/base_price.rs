/// Component C — Base-Price Registry (§4.C).
///
/// Holds `symbol -> base_price` in memory, mirrored to Persistence. This is
/// the exclusive owner of BasePrice mutations (§4.C "Ownership"): the
/// Backfill Orchestrator and Live Collector only ever call through here.
use crate::model::BasePrice;
use crate::persistence::Persistence;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

pub struct BasePriceRegistry {
    prices: RwLock<HashMap<String, f64>>,
    persistence: Persistence,
}

impl BasePriceRegistry {
    pub fn new(persistence: Persistence) -> Self {
        Self { prices: RwLock::new(HashMap::new()), persistence }
    }

    /// Populates the in-memory map from the durable store (§4.C `load`).
    pub async fn load(&self) -> Result<()> {
        let stored = self.persistence.list_base_prices()?;
        let mut guard = self.prices.write().await;
        guard.clear();
        for bp in stored {
            guard.insert(bp.symbol, bp.price);
        }
        Ok(())
    }

    pub async fn get(&self, symbol: &str) -> Option<f64> {
        self.prices.read().await.get(symbol).copied()
    }

    /// If `symbol` has no base yet, sets it atomically in memory and durable
    /// store (§4.C `adopt_if_missing`). No-op, returning `false`, otherwise.
    pub async fn adopt_if_missing(&self, symbol: &str, price: f64, now_ms: i64) -> Result<bool> {
        let mut guard = self.prices.write().await;
        if guard.contains_key(symbol) {
            return Ok(false);
        }
        self.persistence.upsert_base_price(&BasePrice {
            symbol: symbol.to_string(),
            price,
            created_at_ms: now_ms,
        })?;
        guard.insert(symbol.to_string(), price);
        Ok(true)
    }

    /// Merges currently-known bases for `symbols`, skipping any symbol
    /// without one (§4.C `snapshot_known`; primarily a backfill helper).
    pub async fn snapshot_known(&self, symbols: &[String]) -> HashMap<String, f64> {
        let guard = self.prices.read().await;
        symbols
            .iter()
            .filter_map(|s| guard.get(s).map(|price| (s.clone(), *price)))
            .collect()
    }

    /// Full current snapshot, used by the aggregator on the live-tick path.
    pub async fn snapshot_all(&self) -> HashMap<String, f64> {
        self.prices.read().await.clone()
    }

    /// Revokes the base of every symbol currently held that is absent from
    /// `active_set` (§4.C `reconcile_with_active`). Historical candles are
    /// untouched; a later re-appearance re-adopts at the then-current price.
    pub async fn reconcile_with_active(&self, active_set: &HashSet<String>) -> Result<Vec<String>> {
        let mut guard = self.prices.write().await;
        let revoked: Vec<String> =
            guard.keys().filter(|symbol| !active_set.contains(symbol.as_str())).cloned().collect();

        for symbol in &revoked {
            self.persistence.delete_base_price(symbol)?;
            guard.remove(symbol);
        }

        Ok(revoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> BasePriceRegistry {
        BasePriceRegistry::new(Persistence::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn adopt_if_missing_sets_once() {
        let reg = registry();
        assert!(reg.adopt_if_missing("AAAUSDT", 100.0, 0).await.unwrap());
        assert!(!reg.adopt_if_missing("AAAUSDT", 200.0, 1).await.unwrap());
        assert_eq!(reg.get("AAAUSDT").await, Some(100.0));
    }

    #[tokio::test]
    async fn load_repopulates_from_persistence() {
        let persistence = Persistence::open_in_memory().unwrap();
        persistence
            .upsert_base_price(&BasePrice { symbol: "AAAUSDT".to_string(), price: 50.0, created_at_ms: 0 })
            .unwrap();

        let reg = BasePriceRegistry::new(persistence);
        assert_eq!(reg.get("AAAUSDT").await, None);
        reg.load().await.unwrap();
        assert_eq!(reg.get("AAAUSDT").await, Some(50.0));
    }

    #[tokio::test]
    async fn reconcile_revokes_delisted_symbols() {
        let reg = registry();
        reg.adopt_if_missing("AAAUSDT", 100.0, 0).await.unwrap();
        reg.adopt_if_missing("BBBUSDT", 200.0, 0).await.unwrap();

        let active: HashSet<String> = ["AAAUSDT".to_string()].into_iter().collect();
        let revoked = reg.reconcile_with_active(&active).await.unwrap();

        assert_eq!(revoked, vec!["BBBUSDT".to_string()]);
        assert_eq!(reg.get("AAAUSDT").await, Some(100.0));
        assert_eq!(reg.get("BBBUSDT").await, None);

        // Re-appearance re-adopts at the new price.
        assert!(reg.adopt_if_missing("BBBUSDT", 250.0, 5).await.unwrap());
        assert_eq!(reg.get("BBBUSDT").await, Some(250.0));
    }

    #[tokio::test]
    async fn snapshot_known_skips_symbols_without_base() {
        let reg = registry();
        reg.adopt_if_missing("AAAUSDT", 100.0, 0).await.unwrap();

        let snap = reg
            .snapshot_known(&["AAAUSDT".to_string(), "CCCUSDT".to_string()])
            .await;

        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("AAAUSDT"), Some(&100.0));
    }
}
