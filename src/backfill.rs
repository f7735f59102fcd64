/// Component E — Backfill Orchestrator, two-phase concurrent fill (§4.E).
use crate::aggregator::aggregate_bucket;
use crate::context::Context;
use crate::model::FIVE_MINUTES_MS;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Semaphore;

/// Candles requested per page from the exchange during backfill/gap-repair.
const PAGE_LIMIT: u16 = 500;

/// After this many consecutive failures for one symbol's worker, cool down
/// for five seconds before the next page attempt (§4.E step 4, §7).
const FAILURE_COOLDOWN_EVERY: u32 = 10;
const FAILURE_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Default, Clone)]
pub struct BackfillSummary {
    /// Active symbols a phase fanned a worker out to.
    pub symbols_processed: usize,
    /// New candle rows written across both phases, after de-duplication
    /// against what was already on disk.
    pub candles_inserted: usize,
    /// `IndexRow`s computed for buckets that had none yet.
    pub index_rows_computed: usize,
}

/// Runs phase 1 then phase 2 of the backfill. Sets and clears the
/// backfill-in-progress flag around the whole operation (§4.F step 1, §9).
pub async fn run_backfill(ctx: &Context) -> Result<BackfillSummary> {
    ctx.backfill_in_progress.store(true, Ordering::SeqCst);
    let outcome = run_backfill_inner(ctx).await;
    ctx.backfill_in_progress.store(false, Ordering::SeqCst);

    if let Err(ref e) = outcome {
        eprintln!("backfill failed: {e:#}");
    }
    outcome
}

async fn run_backfill_inner(ctx: &Context) -> Result<BackfillSummary> {
    let mut summary = BackfillSummary::default();

    // Phase 1 start: empty table backfills the full window, a table that's
    // already caught up (max_bucket >= phase1_end) skips phase 1 entirely
    // (None), and anything in between resumes one bucket past the high
    // watermark.
    let phase1_end = floor_5min_ms(Utc::now().timestamp_millis()) - FIVE_MINUTES_MS;
    let phase1_start = match ctx.persistence.candle_table_is_empty()? {
        true => Some(phase1_end - ChronoDuration::days(ctx.config.backfill_days).num_milliseconds()),
        false => match ctx.persistence.max_bucket_start()? {
            Some(max_bucket) if max_bucket >= phase1_end => None,
            Some(max_bucket) => Some(max_bucket + FIVE_MINUTES_MS),
            None => Some(phase1_end - ChronoDuration::days(ctx.config.backfill_days).num_milliseconds()),
        },
    };

    if let Some(phase1_start) = phase1_start {
        if phase1_start <= phase1_end {
            let (candles, symbols) = fill_range(ctx, phase1_start, phase1_end, true).await?;
            summary.candles_inserted += candles;
            summary.symbols_processed += symbols;
            summary.index_rows_computed += compute_missing_index_rows(ctx, phase1_start, phase1_end).await?;
        }
    }

    // Phase 2: re-read the clock, catch up on buckets that closed while
    // phase 1 was running. No base-price collection (§4.E).
    let phase2_start = phase1_end + FIVE_MINUTES_MS;
    let phase2_end = floor_5min_ms(Utc::now().timestamp_millis()) - FIVE_MINUTES_MS;
    if phase2_start <= phase2_end {
        let (candles, symbols) = fill_range(ctx, phase2_start, phase2_end, false).await?;
        summary.candles_inserted += candles;
        summary.symbols_processed += symbols;
        summary.index_rows_computed += compute_missing_index_rows(ctx, phase2_start, phase2_end).await?;
    }

    Ok(summary)
}

/// Fans out one semaphore-gated worker per active symbol over `[start, end]`.
/// Returns `(total candles inserted, symbols processed)`. When
/// `collect_base` is set, each worker's first observed open price is
/// adopted as a tentative base for symbols the registry does not yet know.
async fn fill_range(
    ctx: &Context,
    start_ms: i64,
    end_ms: i64,
    collect_base: bool,
) -> Result<(usize, usize)> {
    let active_symbols = ctx.exchange.list_active_symbols().await?;
    if active_symbols.is_empty() {
        return Ok((0, 0));
    }

    let semaphore = Arc::new(Semaphore::new(ctx.config.backfill_concurrency.max(1)));
    let mut tasks = Vec::with_capacity(active_symbols.len());

    for symbol in active_symbols.iter().cloned() {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            backfill_one_symbol(&ctx, &symbol, start_ms, end_ms).await
        }));
    }

    let mut total_inserted = 0usize;
    let processed = active_symbols.len();
    let now_ms = Utc::now().timestamp_millis();

    let results = future::join_all(tasks).await;
    for (symbol, task) in active_symbols.into_iter().zip(results) {
        match task {
            Ok(Ok(result)) => {
                total_inserted += result.inserted;
                if collect_base {
                    if let Some(open) = result.first_open {
                        ctx.base_prices.adopt_if_missing(&symbol, open, now_ms).await?;
                    }
                }
            }
            Ok(Err(e)) => eprintln!("backfill worker for {symbol} failed: {e:#}"),
            Err(e) => eprintln!("backfill worker for {symbol} panicked: {e:#}"),
        }
    }

    Ok((total_inserted, processed))
}

struct SymbolBackfillResult {
    inserted: usize,
    /// Open price of the first candle this worker observed, for base-price
    /// adoption when `fill_range` was called with `collect_base`.
    first_open: Option<f64>,
}

async fn backfill_one_symbol(
    ctx: &Context,
    symbol: &str,
    start_ms: i64,
    end_ms: i64,
) -> Result<SymbolBackfillResult> {
    let already_present: HashSet<i64> = ctx
        .persistence
        .existing_bucket_starts_for_symbol(symbol, start_ms, end_ms)?
        .into_iter()
        .collect();

    let mut cursor = start_ms;
    let mut inserted = 0usize;
    let mut first_open = None;
    let mut consecutive_failures = 0u32;

    while cursor <= end_ms {
        if ctx.exchange.is_rate_limited() {
            break;
        }

        match ctx.exchange.fetch_candle_range(symbol, cursor, end_ms, PAGE_LIMIT).await {
            Ok(batch) if batch.is_empty() => break,
            Ok(batch) => {
                consecutive_failures = 0;
                if first_open.is_none() {
                    first_open = batch.first().map(|c| c.open);
                }

                let last_bucket = batch.last().map(|c| c.bucket_start_ms).unwrap_or(cursor);
                let fresh: Vec<_> =
                    batch.into_iter().filter(|c| !already_present.contains(&c.bucket_start_ms)).collect();
                inserted += ctx.persistence.insert_candles_bulk(&fresh)?;

                cursor = last_bucket + FIVE_MINUTES_MS;
                if cursor <= end_ms {
                    tokio::time::sleep(ctx.config.request_interval()).await;
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                eprintln!("fetch failed for {symbol} at {cursor}: {e:#}");
                if consecutive_failures % FAILURE_COOLDOWN_EVERY == 0 {
                    tokio::time::sleep(FAILURE_COOLDOWN).await;
                }
            }
        }
    }

    Ok(SymbolBackfillResult { inserted, first_open })
}

/// Walks every bucket that has candles in `[start_ms, end_ms]` and computes
/// the `IndexRow` for any that don't have one yet.
async fn compute_missing_index_rows(ctx: &Context, start_ms: i64, end_ms: i64) -> Result<usize> {
    let buckets = ctx.persistence.distinct_bucket_starts_in_range(start_ms, end_ms)?;
    let mut computed = 0usize;

    for bucket in buckets {
        if ctx.persistence.index_row_exists(bucket)? {
            continue;
        }
        let candles = ctx.persistence.candles_at_bucket(bucket)?;
        let bases = ctx.base_prices.snapshot_all().await;
        if let Some(row) = aggregate_bucket(bucket, &candles, &bases) {
            if ctx.persistence.insert_index_row_if_absent(&row)? {
                computed += 1;
            }
        }
    }

    Ok(computed)
}

#[derive(Debug, Default, Clone)]
pub struct GapRepairSummary {
    /// Active symbols scanned for holes in `[t0, t1]`.
    pub symbols_checked: usize,
    /// Contiguous missing runs that were re-fetched and yielded candles.
    pub runs_repaired: usize,
    pub candles_inserted: usize,
}

/// Offline gap repair over `[t0, t1]` (§4.E "Gap repair"): for each active
/// symbol, finds missing instants on the expected five-minute grid, groups
/// them into contiguous runs, and re-fetches each run.
pub async fn repair_gaps(ctx: &Context, t0_ms: i64, t1_ms: i64) -> Result<GapRepairSummary> {
    let mut summary = GapRepairSummary::default();
    let active_symbols = ctx.exchange.list_active_symbols().await?;

    for symbol in active_symbols {
        summary.symbols_checked += 1;
        let present: HashSet<i64> = ctx
            .persistence
            .existing_bucket_starts_for_symbol(&symbol, t0_ms, t1_ms)?
            .into_iter()
            .collect();

        let expected_grid = expected_grid(t0_ms, t1_ms);
        let missing: Vec<i64> = expected_grid.into_iter().filter(|b| !present.contains(b)).collect();
        let runs = group_contiguous_runs(&missing);

        for (run_start, run_end) in runs {
            let candles = ctx
                .exchange
                .fetch_candle_range_paged(&symbol, run_start, run_end, PAGE_LIMIT)
                .await?;
            if candles.is_empty() {
                continue;
            }
            summary.candles_inserted += ctx.persistence.insert_candles_bulk(&candles)?;
            summary.runs_repaired += 1;
        }
    }

    Ok(summary)
}

fn expected_grid(t0_ms: i64, t1_ms: i64) -> Vec<i64> {
    let mut grid = Vec::new();
    let mut t = floor_5min_ms(t0_ms);
    while t <= t1_ms {
        grid.push(t);
        t += FIVE_MINUTES_MS;
    }
    grid
}

/// Groups a sorted sequence of missing bucket_starts into `(start, end)`
/// pairs of maximal contiguous runs on the five-minute grid.
fn group_contiguous_runs(missing: &[i64]) -> Vec<(i64, i64)> {
    let mut runs = Vec::new();
    let mut iter = missing.iter().peekable();

    while let Some(&run_start) = iter.next() {
        let mut run_end = run_start;
        while let Some(&&next) = iter.peek() {
            if next == run_end + FIVE_MINUTES_MS {
                run_end = next;
                iter.next();
            } else {
                break;
            }
        }
        runs.push((run_start, run_end));
    }

    runs
}

fn floor_5min_ms(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(FIVE_MINUTES_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_contiguous_runs() {
        let missing = vec![0, 300_000, 600_000, 1_500_000, 1_800_000];
        let runs = group_contiguous_runs(&missing);
        assert_eq!(runs, vec![(0, 600_000), (1_500_000, 1_800_000)]);
    }

    #[test]
    fn expected_grid_covers_inclusive_range() {
        let grid = expected_grid(0, 600_000);
        assert_eq!(grid, vec![0, 300_000, 600_000]);
    }

    #[test]
    fn floor_5min_ms_rounds_down() {
        assert_eq!(floor_5min_ms(301_000), 300_000);
        assert_eq!(floor_5min_ms(300_000), 300_000);
    }
}
