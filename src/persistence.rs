/// Component B — Persistence (§4.B).
///
/// A SQLite-backed store for the three logical tables of §6: `candle`,
/// `index_row`, `base_price`. `rusqlite` is synchronous, as in the teacher;
/// the connection is wrapped in a `Mutex` so `Persistence` can be cloned
/// (cheaply, via the inner `Arc`) into every task that needs it, matching
/// how the teacher's `DatabaseManager` is handed around.
use crate::model::{BasePrice, Candle, IndexRow};
use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Upper bound on rows per multi-row INSERT statement (§4.B).
const BULK_INSERT_BATCH: usize = 2000;

#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
}

impl Persistence {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS candle (
                symbol TEXT NOT NULL,
                bucket_start_ms INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                quote_volume REAL NOT NULL,
                PRIMARY KEY (symbol, bucket_start_ms)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candle_bucket ON candle (bucket_start_ms)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_candle_symbol_bucket ON candle (symbol, bucket_start_ms)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS index_row (
                bucket_start_ms INTEGER NOT NULL UNIQUE,
                index_value REAL NOT NULL,
                total_volume REAL NOT NULL,
                coin_count INTEGER NOT NULL,
                up_count INTEGER NOT NULL,
                down_count INTEGER NOT NULL,
                adr REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_index_row_bucket ON index_row (bucket_start_ms)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS base_price (
                symbol TEXT NOT NULL UNIQUE,
                price REAL NOT NULL,
                created_at_ms INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // ---------------------------------------------------------------
    // Candle
    // ---------------------------------------------------------------

    /// Insert-or-ignore bulk append, batched at `BULK_INSERT_BATCH` rows per
    /// statement (§4.B). Returns the number of rows actually inserted.
    pub fn insert_candles_bulk(&self, candles: &[Candle]) -> Result<usize> {
        if candles.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().expect("candle db lock poisoned");
        let mut inserted = 0usize;

        for chunk in candles.chunks(BULK_INSERT_BATCH) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO candle
                        (symbol, bucket_start_ms, open, high, low, close, quote_volume)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for c in chunk {
                    let changes = stmt.execute(params![
                        c.symbol,
                        c.bucket_start_ms,
                        c.open,
                        c.high,
                        c.low,
                        c.close,
                        c.quote_volume
                    ])?;
                    inserted += changes;
                }
            }
            tx.commit()?;
        }

        Ok(inserted)
    }

    /// Used by the backfill orchestrator to distinguish a fresh database
    /// (full-window backfill) from a resumed one (catch-up from the high
    /// watermark).
    pub fn candle_table_is_empty(&self) -> Result<bool> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM candle", [], |row| row.get(0))?;
        Ok(count == 0)
    }

    /// Highest `bucket_start_ms` across every symbol, or `None` on an empty table.
    pub fn max_bucket_start(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        conn.query_row("SELECT MAX(bucket_start_ms) FROM candle", [], |row| row.get::<_, Option<i64>>(0))
            .map_err(Into::into)
    }

    /// Every bucket that has at least one candle in `[t0, t1]`, used by the
    /// backfill orchestrator to know which buckets still need an `IndexRow`.
    pub fn distinct_bucket_starts_in_range(&self, t0_ms: i64, t1_ms: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT DISTINCT bucket_start_ms FROM candle
             WHERE bucket_start_ms >= ?1 AND bucket_start_ms <= ?2
             ORDER BY bucket_start_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![t0_ms, t1_ms], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }

    /// Already-present `(symbol, bucket_start_ms)` pairs in `[t0, t1]`, used
    /// by the backfill orchestrator's skip-detection preload (§4.E).
    pub fn existing_bucket_starts_for_symbol(
        &self,
        symbol: &str,
        t0_ms: i64,
        t1_ms: i64,
    ) -> Result<Vec<i64>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT bucket_start_ms FROM candle
             WHERE symbol = ?1 AND bucket_start_ms >= ?2 AND bucket_start_ms <= ?3
             ORDER BY bucket_start_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![symbol, t0_ms, t1_ms], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }

    /// One symbol's candles in `[t0, t1]`, ascending by bucket.
    pub fn candles_for_symbol_in_range(
        &self,
        symbol: &str,
        t0_ms: i64,
        t1_ms: i64,
    ) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT symbol, bucket_start_ms, open, high, low, close, quote_volume
             FROM candle
             WHERE symbol = ?1 AND bucket_start_ms >= ?2 AND bucket_start_ms <= ?3
             ORDER BY bucket_start_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![symbol, t0_ms, t1_ms], row_to_candle)?
            .collect::<rusqlite::Result<Vec<Candle>>>()?;
        Ok(rows)
    }

    /// Every symbol's candles in `[t0, t1]`, ordered by symbol then bucket.
    pub fn candles_in_range_all(&self, t0_ms: i64, t1_ms: i64) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT symbol, bucket_start_ms, open, high, low, close, quote_volume
             FROM candle
             WHERE bucket_start_ms >= ?1 AND bucket_start_ms <= ?2
             ORDER BY symbol ASC, bucket_start_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![t0_ms, t1_ms], row_to_candle)?
            .collect::<rusqlite::Result<Vec<Candle>>>()?;
        Ok(rows)
    }

    /// Every symbol's candle at one exact bucket, used by aggregation.
    pub fn candles_at_bucket(&self, bucket_start_ms: i64) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT symbol, bucket_start_ms, open, high, low, close, quote_volume
             FROM candle WHERE bucket_start_ms = ?1 ORDER BY symbol ASC",
        )?;
        let rows = stmt
            .query_map(params![bucket_start_ms], row_to_candle)?
            .collect::<rusqlite::Result<Vec<Candle>>>()?;
        Ok(rows)
    }

    /// Per-symbol `max(high)`/`min(low)` over `[t0, t1]` (§4.B, used by
    /// the distribution query's max/min excursion).
    pub fn max_high_min_low_per_symbol(
        &self,
        t0_ms: i64,
        t1_ms: i64,
    ) -> Result<HashMap<String, (f64, f64)>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT symbol, MAX(high), MIN(low) FROM candle
             WHERE bucket_start_ms >= ?1 AND bucket_start_ms <= ?2
             GROUP BY symbol",
        )?;
        let mut out = HashMap::new();
        let rows = stmt.query_map(params![t0_ms, t1_ms], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?))
        })?;
        for row in rows {
            let (symbol, high, low) = row?;
            out.insert(symbol, (high, low));
        }
        Ok(out)
    }

    /// All symbols' candles at the earliest `bucket_start_ms >= t` (§4.G step 1).
    pub fn earliest_candles_at_or_after(&self, t_ms: i64) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let earliest: Option<i64> = conn
            .query_row(
                "SELECT MIN(bucket_start_ms) FROM candle WHERE bucket_start_ms >= ?1",
                params![t_ms],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        drop(conn);

        match earliest {
            Some(bucket) => self.candles_at_bucket(bucket),
            None => Ok(Vec::new()),
        }
    }

    /// All symbols' candles at the latest `bucket_start_ms <= t` (§4.G step 2).
    pub fn latest_candles_at_or_before(&self, t_ms: i64) -> Result<Vec<Candle>> {
        let conn = self.conn.lock().expect("candle db lock poisoned");
        let latest: Option<i64> = conn
            .query_row(
                "SELECT MAX(bucket_start_ms) FROM candle WHERE bucket_start_ms <= ?1",
                params![t_ms],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        drop(conn);

        match latest {
            Some(bucket) => self.candles_at_bucket(bucket),
            None => Ok(Vec::new()),
        }
    }

    // ---------------------------------------------------------------
    // IndexRow
    // ---------------------------------------------------------------

    /// Returns `true` iff the row was newly inserted (idempotent: a repeat
    /// call with the same `bucket_start_ms` is a silent no-op, §3, §7).
    pub fn insert_index_row_if_absent(&self, row: &IndexRow) -> Result<bool> {
        let conn = self.conn.lock().expect("index_row db lock poisoned");
        let changes = conn.execute(
            "INSERT OR IGNORE INTO index_row
                (bucket_start_ms, index_value, total_volume, coin_count, up_count, down_count, adr)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.bucket_start_ms,
                row.index_value,
                row.total_volume,
                row.coin_count,
                row.up_count,
                row.down_count,
                row.adr
            ],
        )?;
        Ok(changes > 0)
    }

    /// The idempotency check the Live Collector and backfill orchestrator
    /// both use before committing a new `IndexRow`.
    pub fn index_row_exists(&self, bucket_start_ms: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("index_row db lock poisoned");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM index_row WHERE bucket_start_ms = ?1",
            params![bucket_start_ms],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn index_rows_in_range(&self, t0_ms: i64, t1_ms: i64) -> Result<Vec<IndexRow>> {
        let conn = self.conn.lock().expect("index_row db lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT bucket_start_ms, index_value, total_volume, coin_count, up_count, down_count, adr
             FROM index_row WHERE bucket_start_ms >= ?1 AND bucket_start_ms <= ?2
             ORDER BY bucket_start_ms ASC",
        )?;
        let rows = stmt
            .query_map(params![t0_ms, t1_ms], row_to_index_row)?
            .collect::<rusqlite::Result<Vec<IndexRow>>>()?;
        Ok(rows)
    }

    pub fn latest_index_row(&self) -> Result<Option<IndexRow>> {
        let conn = self.conn.lock().expect("index_row db lock poisoned");
        conn.query_row(
            "SELECT bucket_start_ms, index_value, total_volume, coin_count, up_count, down_count, adr
             FROM index_row ORDER BY bucket_start_ms DESC LIMIT 1",
            [],
            row_to_index_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Admin range-delete (§6 `DELETE /index/data`): deletes candles and
    /// index rows in lockstep (§3).
    pub fn delete_range(&self, t0_ms: i64, t1_ms: i64) -> Result<(usize, usize)> {
        let conn = self.conn.lock().expect("range delete lock poisoned");
        let candles_deleted = conn.execute(
            "DELETE FROM candle WHERE bucket_start_ms >= ?1 AND bucket_start_ms <= ?2",
            params![t0_ms, t1_ms],
        )?;
        let index_rows_deleted = conn.execute(
            "DELETE FROM index_row WHERE bucket_start_ms >= ?1 AND bucket_start_ms <= ?2",
            params![t0_ms, t1_ms],
        )?;
        Ok((candles_deleted, index_rows_deleted))
    }

    /// Admin per-symbol purge (§6 `DELETE /index/symbol/{symbol}`).
    pub fn delete_symbol(&self, symbol: &str) -> Result<(usize, usize)> {
        let conn = self.conn.lock().expect("symbol delete lock poisoned");
        let candles_deleted =
            conn.execute("DELETE FROM candle WHERE symbol = ?1", params![symbol])?;
        let base_prices_deleted =
            conn.execute("DELETE FROM base_price WHERE symbol = ?1", params![symbol])?;
        Ok((candles_deleted, base_prices_deleted))
    }

    // ---------------------------------------------------------------
    // BasePrice
    // ---------------------------------------------------------------

    /// Loads the whole base-price registry, used to reconstruct it at startup.
    pub fn list_base_prices(&self) -> Result<Vec<BasePrice>> {
        let conn = self.conn.lock().expect("base_price db lock poisoned");
        let mut stmt =
            conn.prepare("SELECT symbol, price, created_at_ms FROM base_price ORDER BY symbol ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(BasePrice {
                    symbol: row.get(0)?,
                    price: row.get(1)?,
                    created_at_ms: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<BasePrice>>>()?;
        Ok(rows)
    }

    /// Inserts a new base price or overwrites the existing one for `symbol`.
    pub fn upsert_base_price(&self, base: &BasePrice) -> Result<()> {
        let conn = self.conn.lock().expect("base_price db lock poisoned");
        conn.execute(
            "INSERT INTO base_price (symbol, price, created_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET price = excluded.price, created_at_ms = excluded.created_at_ms",
            params![base.symbol, base.price, base.created_at_ms],
        )?;
        Ok(())
    }

    pub fn delete_base_price(&self, symbol: &str) -> Result<()> {
        let conn = self.conn.lock().expect("base_price db lock poisoned");
        conn.execute("DELETE FROM base_price WHERE symbol = ?1", params![symbol])?;
        Ok(())
    }
}

fn row_to_candle(row: &rusqlite::Row) -> rusqlite::Result<Candle> {
    Ok(Candle {
        symbol: row.get(0)?,
        bucket_start_ms: row.get(1)?,
        open: row.get(2)?,
        high: row.get(3)?,
        low: row.get(4)?,
        close: row.get(5)?,
        quote_volume: row.get(6)?,
    })
}

fn row_to_index_row(row: &rusqlite::Row) -> rusqlite::Result<IndexRow> {
    Ok(IndexRow {
        bucket_start_ms: row.get(0)?,
        index_value: row.get(1)?,
        total_volume: row.get(2)?,
        coin_count: row.get(3)?,
        up_count: row.get(4)?,
        down_count: row.get(5)?,
        adr: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(symbol: &str, bucket_start_ms: i64, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            bucket_start_ms,
            open: close,
            high: close,
            low: close,
            close,
            quote_volume: 10.0,
        }
    }

    #[test]
    fn bulk_insert_is_idempotent() {
        let db = Persistence::open_in_memory().unwrap();
        let candles = vec![candle("AAAUSDT", 0, 100.0), candle("AAAUSDT", 300_000, 101.0)];

        assert_eq!(db.insert_candles_bulk(&candles).unwrap(), 2);
        assert_eq!(db.insert_candles_bulk(&candles).unwrap(), 0);
        assert_eq!(db.candles_for_symbol_in_range("AAAUSDT", 0, 300_000).unwrap().len(), 2);
    }

    #[test]
    fn index_row_insert_is_idempotent() {
        let db = Persistence::open_in_memory().unwrap();
        let row = IndexRow {
            bucket_start_ms: 300_000,
            index_value: 5.0,
            total_volume: 100.0,
            coin_count: 1,
            up_count: 1,
            down_count: 0,
            adr: 1.0,
        };

        assert!(db.insert_index_row_if_absent(&row).unwrap());
        assert!(!db.insert_index_row_if_absent(&row).unwrap());
        assert!(db.index_row_exists(300_000).unwrap());
    }

    #[test]
    fn range_delete_removes_both_tables() {
        let db = Persistence::open_in_memory().unwrap();
        db.insert_candles_bulk(&[candle("AAAUSDT", 0, 100.0)]).unwrap();
        db.insert_index_row_if_absent(&IndexRow {
            bucket_start_ms: 0,
            index_value: 0.0,
            total_volume: 0.0,
            coin_count: 1,
            up_count: 0,
            down_count: 0,
            adr: 0.0,
        })
        .unwrap();

        let (candles_deleted, rows_deleted) = db.delete_range(0, 0).unwrap();
        assert_eq!(candles_deleted, 1);
        assert_eq!(rows_deleted, 1);
    }

    #[test]
    fn base_price_upsert_replaces_existing() {
        let db = Persistence::open_in_memory().unwrap();
        db.upsert_base_price(&BasePrice { symbol: "AAAUSDT".to_string(), price: 100.0, created_at_ms: 0 })
            .unwrap();
        db.upsert_base_price(&BasePrice { symbol: "AAAUSDT".to_string(), price: 105.0, created_at_ms: 1 })
            .unwrap();

        let all = db.list_base_prices().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].price, 105.0);
    }
}
