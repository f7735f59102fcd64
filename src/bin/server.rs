/// Ambient Component L — CLI entry point (SPEC_FULL.md §4.L).
use anyhow::Result;
use breadth_index::backfill::{repair_gaps, run_backfill};
use breadth_index::collector::run_tick;
use breadth_index::config::Config;
use breadth_index::context::Context;
use breadth_index::http::run_http_server;
use breadth_index::persistence::Persistence;
use chrono::{NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs backfill, then the live-tick scheduler and HTTP surface (default).
    Serve,
    /// Runs an offline gap-repair pass over `[start, end]` and exits.
    Repair {
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env();
    let persistence = Persistence::open(&config.db_path)?;
    let ctx = Context::new(config, persistence);
    ctx.base_prices.load().await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(ctx).await,
        Command::Repair { start, end } => {
            let t0 = parse_naive_utc(&start)?;
            let t1 = parse_naive_utc(&end)?;
            let summary = repair_gaps(&ctx, t0, t1).await?;
            println!(
                "repair complete: {} symbols checked, {} runs repaired, {} candles inserted",
                summary.symbols_checked, summary.runs_repaired, summary.candles_inserted
            );
            Ok(())
        }
    }
}

async fn serve(ctx: Context) -> Result<()> {
    println!("starting backfill...");
    match run_backfill(&ctx).await {
        Ok(summary) => println!(
            "backfill complete: {} symbols, {} candles, {} index rows",
            summary.symbols_processed, summary.candles_inserted, summary.index_rows_computed
        ),
        Err(e) => eprintln!("backfill did not complete: {e:#}"),
    }

    let tick_ctx = ctx.clone();
    let scheduler = tokio::spawn(async move { run_scheduler(tick_ctx).await });

    run_http_server(ctx).await?;
    scheduler.abort();
    Ok(())
}

/// Fires `run_tick` every five minutes, `tick_offset_secs` seconds past the
/// minute (§4.F, §5 "Schedulers").
async fn run_scheduler(ctx: Context) {
    loop {
        let now = Utc::now();
        let offset = ctx.config.tick_offset_secs as i64;
        let secs_into_bucket = now.timestamp() % 300;
        let mut wait = (300 - secs_into_bucket) + offset;
        if wait <= 0 {
            wait += 300;
        }
        tokio::time::sleep(std::time::Duration::from_secs(wait as u64)).await;

        match run_tick(&ctx).await {
            Ok(outcome) => println!("live tick: {outcome:?}"),
            Err(e) => eprintln!("live tick failed: {e:#}"),
        }
    }
}

fn parse_naive_utc(value: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M")?;
    Ok(Utc.from_utc_datetime(&naive).timestamp_millis())
}
