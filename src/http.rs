/// Ambient Component K — HTTP query surface (§6, SPEC_FULL.md §4.K).
///
/// A thin `actix-web` binding of the exact route table in §6. The web UI,
/// static-file serving, and the WebSocket/actor push path the teacher's own
/// `web_server.rs` carries are not reproduced here: streaming push and a
/// front-end are explicit Non-goals (§1). Only the JSON contract survives.
use crate::backfill::repair_gaps;
use crate::context::Context;
use crate::distribution;
use crate::error::QueryError;
use crate::model::FIVE_MINUTES_MS;
use crate::time_spec::TimeSpec;
use crate::uptrend::{self, UptrendParams};
use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, web};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
struct RangeQuery {
    hours: Option<f64>,
    start: Option<String>,
    end: Option<String>,
    timezone: Option<String>,
}

impl RangeQuery {
    fn into_time_spec(self) -> Result<TimeSpec, QueryError> {
        match (self.hours, self.start, self.end) {
            (Some(hours), _, _) => Ok(TimeSpec::LookbackHours(hours)),
            (None, Some(start), Some(end)) => {
                Ok(TimeSpec::AbsoluteRange { start, end, timezone: self.timezone })
            }
            _ => Err(QueryError::InvalidTimeFormat(
                "supply either `hours` or both `start` and `end`".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UptrendQuery {
    hours: Option<f64>,
    start: Option<String>,
    end: Option<String>,
    timezone: Option<String>,
    #[serde(rename = "keepRatio")]
    keep_ratio: Option<f64>,
    #[serde(rename = "noNewHighCandles")]
    no_new_high_candles: Option<u32>,
    #[serde(rename = "minUptrend")]
    min_uptrend: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RepairQuery {
    days: Option<i64>,
    start: Option<String>,
    end: Option<String>,
    timezone: Option<String>,
}

fn ok_json<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(data)
}

/// Missing-input case (§7): no error status, a `success=false` body.
fn soft_failure(message: impl Into<String>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "success": false, "message": message.into() }))
}

/// Input-validation case (§7): 4xx naming the expected format.
fn validation_failure(err: QueryError) -> HttpResponse {
    match err {
        QueryError::Internal(e) => {
            HttpResponse::InternalServerError().json(json!({ "success": false, "message": e.to_string() }))
        }
        other => HttpResponse::BadRequest().json(json!({ "success": false, "message": other.to_string() })),
    }
}

async fn get_current(ctx: web::Data<Context>) -> HttpResponse {
    match ctx.persistence.latest_index_row() {
        Ok(Some(row)) => ok_json(json!({
            "timestamp_ms": row.bucket_start_ms,
            "index_value": row.index_value,
            "total_volume": row.total_volume,
            "coin_count": row.coin_count,
            "up_count": row.up_count,
            "down_count": row.down_count,
            "adr": row.adr,
        })),
        Ok(None) => soft_failure("no index data yet"),
        Err(e) => validation_failure(QueryError::Internal(e)),
    }
}

async fn get_history(ctx: web::Data<Context>, query: web::Query<HistoryQuery>) -> HttpResponse {
    let hours = query.hours.unwrap_or(168);
    let end_ms = floor_5min_ms(Utc::now().timestamp_millis());
    let start_ms = end_ms - hours * 3_600_000;

    match ctx.persistence.index_rows_in_range(start_ms, end_ms) {
        Ok(rows) => ok_json(
            rows.into_iter()
                .map(|row| {
                    json!({
                        "timestamp_ms": row.bucket_start_ms,
                        "index_value": row.index_value,
                        "total_volume": row.total_volume,
                        "coin_count": row.coin_count,
                        "up_count": row.up_count,
                        "down_count": row.down_count,
                        "adr": row.adr,
                    })
                })
                .collect::<Vec<_>>(),
        ),
        Err(e) => validation_failure(QueryError::Internal(e)),
    }
}

async fn get_stats(ctx: web::Data<Context>) -> HttpResponse {
    let now_ms = floor_5min_ms(Utc::now().timestamp_millis());
    let current = match ctx.persistence.latest_index_row() {
        Ok(Some(row)) => row,
        Ok(None) => return soft_failure("no index data yet"),
        Err(e) => return validation_failure(QueryError::Internal(e)),
    };

    let window_delta = |hours: i64| -> serde_json::Value {
        let window_start = now_ms - hours * 3_600_000;
        let rows = ctx.persistence.index_rows_in_range(window_start, now_ms).unwrap_or_default();
        if rows.is_empty() {
            return json!({ "change": null, "high": null, "low": null });
        }
        let first = rows.first().unwrap().index_value;
        let last = rows.last().unwrap().index_value;
        let high = rows.iter().map(|r| r.index_value).fold(f64::NEG_INFINITY, f64::max);
        let low = rows.iter().map(|r| r.index_value).fold(f64::INFINITY, f64::min);
        json!({ "change": last - first, "high": high, "low": low })
    };

    let w24 = window_delta(24);
    let w3d = window_delta(24 * 3);
    let w7d = window_delta(24 * 7);
    let w30d = window_delta(24 * 30);

    ok_json(json!({
        "current": current.index_value,
        "coin_count": current.coin_count,
        "last_update_ms": current.bucket_start_ms,
        "change24h": w24["change"], "high24h": w24["high"], "low24h": w24["low"],
        "change3d": w3d["change"], "high3d": w3d["high"], "low3d": w3d["low"],
        "change7d": w7d["change"], "high7d": w7d["high"], "low7d": w7d["low"],
        "change30d": w30d["change"], "high30d": w30d["high"], "low30d": w30d["low"],
    }))
}

async fn get_distribution(ctx: web::Data<Context>, query: web::Query<RangeQuery>) -> HttpResponse {
    let spec = match query.into_inner().into_time_spec() {
        Ok(spec) => spec,
        Err(e) => return validation_failure(e),
    };
    match distribution::query(&ctx, spec).await {
        Ok(Some(result)) => ok_json(json!({
            "success": true,
            "totalCoins": result.total_coins,
            "upCount": result.up_count,
            "downCount": result.down_count,
            "distribution": result.distribution,
            "allCoinsRanking": result.all_coins_ranking,
        })),
        Ok(None) => soft_failure("no candles yet in the requested range"),
        Err(e) => validation_failure(e),
    }
}

async fn get_uptrend_distribution(ctx: web::Data<Context>, query: web::Query<UptrendQuery>) -> HttpResponse {
    let query = query.into_inner();
    let spec = match (query.hours, query.start.clone(), query.end.clone()) {
        (Some(hours), _, _) => TimeSpec::LookbackHours(hours),
        (None, Some(start), Some(end)) => {
            TimeSpec::AbsoluteRange { start, end, timezone: query.timezone.clone() }
        }
        _ => {
            return validation_failure(QueryError::InvalidTimeFormat(
                "supply either `hours` or both `start` and `end`".to_string(),
            ));
        }
    };

    let params = UptrendParams {
        keep_ratio: query.keep_ratio.unwrap_or(0.75),
        no_new_high_candles: query.no_new_high_candles.unwrap_or(6),
        min_uptrend_pct: query.min_uptrend.unwrap_or(4.0),
    };

    match uptrend::query(&ctx, spec, params).await {
        Ok(Some(result)) => ok_json(json!({
            "success": true,
            "totalCoins": result.total_coins,
            "ongoingCount": result.ongoing_count,
            "avgUptrend": result.avg_uptrend,
            "maxUptrend": result.max_uptrend,
            "distribution": result.distribution,
            "allCoinsRanking": result.all_coins_ranking,
        })),
        Ok(None) => soft_failure("no candles yet in the requested range"),
        Err(e) => validation_failure(e),
    }
}

async fn delete_data(ctx: web::Data<Context>, query: web::Query<RangeQuery>) -> HttpResponse {
    let spec = match query.into_inner().into_time_spec() {
        Ok(spec) => spec,
        Err(e) => return validation_failure(e),
    };
    let (t0, t1) = match spec.normalize(Utc::now(), &ctx.config.default_timezone) {
        Ok(range) => range,
        Err(e) => return validation_failure(e),
    };

    match ctx.persistence.delete_range(t0.timestamp_millis(), t1.timestamp_millis()) {
        Ok((candles_deleted, index_rows_deleted)) => {
            ok_json(json!({ "success": true, "candles_deleted": candles_deleted, "index_rows_deleted": index_rows_deleted }))
        }
        Err(e) => validation_failure(QueryError::Internal(e)),
    }
}

async fn delete_symbol(ctx: web::Data<Context>, symbol: web::Path<String>) -> HttpResponse {
    match ctx.persistence.delete_symbol(&symbol.to_uppercase()) {
        Ok((candles_deleted, base_prices_deleted)) => {
            ok_json(json!({ "success": true, "candles_deleted": candles_deleted, "base_prices_deleted": base_prices_deleted }))
        }
        Err(e) => validation_failure(QueryError::Internal(e)),
    }
}

async fn post_repair(ctx: web::Data<Context>, query: web::Query<RepairQuery>) -> HttpResponse {
    let query = query.into_inner();
    let now_ms = floor_5min_ms(Utc::now().timestamp_millis()) - FIVE_MINUTES_MS;

    let (t0_ms, t1_ms) = match (query.days, query.start, query.end) {
        (Some(days), _, _) => (now_ms - days * 24 * 3_600_000, now_ms),
        (None, Some(start), Some(end)) => {
            let spec = TimeSpec::AbsoluteRange { start, end, timezone: query.timezone };
            match spec.normalize(Utc::now(), &ctx.config.default_timezone) {
                Ok((t0, t1)) => (t0.timestamp_millis(), t1.timestamp_millis()),
                Err(e) => return validation_failure(e),
            }
        }
        _ => {
            return validation_failure(QueryError::InvalidTimeFormat(
                "supply either `days` or both `start` and `end`".to_string(),
            ));
        }
    };

    match repair_gaps(&ctx, t0_ms, t1_ms).await {
        Ok(summary) => ok_json(json!({
            "success": true,
            "symbols_checked": summary.symbols_checked,
            "runs_repaired": summary.runs_repaired,
            "candles_inserted": summary.candles_inserted,
        })),
        Err(e) => validation_failure(QueryError::Internal(e)),
    }
}

fn floor_5min_ms(ts_ms: i64) -> i64 {
    ts_ms - ts_ms.rem_euclid(FIVE_MINUTES_MS)
}

/// Builds and runs the HTTP surface until shut down. Runs concurrently with
/// the live-tick scheduler in `main` (§5 "Schedulers").
pub async fn run_http_server(ctx: Context) -> std::io::Result<()> {
    let bind = (ctx.config.http_bind.clone(), ctx.config.http_port);
    let data = web::Data::new(ctx);

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(Cors::permissive())
            .route("/index/current", web::get().to(get_current))
            .route("/index/history", web::get().to(get_history))
            .route("/index/stats", web::get().to(get_stats))
            .route("/index/distribution", web::get().to(get_distribution))
            .route("/index/uptrend-distribution", web::get().to(get_uptrend_distribution))
            .route("/index/data", web::delete().to(delete_data))
            .route("/index/symbol/{symbol}", web::delete().to(delete_symbol))
            .route("/index/repair", web::post().to(post_repair))
    })
    .bind(bind)?
    .run()
    .await
}
