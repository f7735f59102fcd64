/// Request-time polymorphism over the two time modes accepted by the
/// distribution and uptrend queries (§4.G, §4.H, Design Notes §9):
/// a look-back in hours, or an explicit `[start, end]` in a named IANA zone.
use crate::error::QueryError;
use crate::model::FIVE_MINUTES_MS;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub enum TimeSpec {
    LookbackHours(f64),
    AbsoluteRange {
        start: String,
        end: String,
        timezone: Option<String>,
    },
}

/// `start`/`end` are parsed with this layout, per §6's `yyyy-MM-dd HH:mm`.
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

impl TimeSpec {
    /// Normalizes to `(aligned_start_utc, aligned_end_utc)`, both floored
    /// to the five-minute grid, relative to `now_utc`.
    pub fn normalize(
        &self,
        now_utc: DateTime<Utc>,
        default_timezone: &str,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), QueryError> {
        match self {
            TimeSpec::LookbackHours(hours) => {
                if !hours.is_finite() || *hours <= 0.0 {
                    return Err(QueryError::OutOfRange(
                        "hours".to_string(),
                        "(0, +inf)".to_string(),
                    ));
                }
                let end = floor_5min(now_utc);
                let millis = (*hours * 3_600_000.0).round() as i64;
                let start = floor_5min(end - chrono::Duration::milliseconds(millis));
                Ok((start, end))
            }
            TimeSpec::AbsoluteRange { start, end, timezone } => {
                let zone_name = timezone.as_deref().unwrap_or(default_timezone);
                let tz: Tz = zone_name
                    .parse()
                    .map_err(|_| QueryError::UnknownTimezone(zone_name.to_string()))?;

                let start_utc = parse_in_zone(start, tz)?;
                let end_utc = parse_in_zone(end, tz)?;

                if start_utc > end_utc {
                    return Err(QueryError::StartAfterEnd);
                }

                Ok((floor_5min(start_utc), floor_5min(end_utc)))
            }
        }
    }
}

fn parse_in_zone(value: &str, tz: Tz) -> Result<DateTime<Utc>, QueryError> {
    let naive = NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
        .map_err(|_| QueryError::InvalidTimeFormat(value.to_string()))?;
    let local = tz
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| QueryError::InvalidTimeFormat(value.to_string()))?;
    Ok(local.with_timezone(&Utc))
}

/// Floors a UTC instant down to the nearest five-minute boundary.
pub fn floor_5min(dt: DateTime<Utc>) -> DateTime<Utc> {
    let ts = dt.timestamp_millis();
    let floored = ts - ts.rem_euclid(FIVE_MINUTES_MS);
    DateTime::<Utc>::from_timestamp_millis(floored).expect("floored timestamp in range")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookback_aligns_to_five_minutes() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 7, 33).unwrap();
        let (start, end) = TimeSpec::LookbackHours(1.0)
            .normalize(now, "Asia/Shanghai")
            .unwrap();
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 12, 5, 0).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 1, 1, 11, 5, 0).unwrap());
    }

    #[test]
    fn absolute_range_rejects_start_after_end() {
        let spec = TimeSpec::AbsoluteRange {
            start: "2026-01-02 00:00".to_string(),
            end: "2026-01-01 00:00".to_string(),
            timezone: None,
        };
        let now = Utc::now();
        assert!(matches!(
            spec.normalize(now, "Asia/Shanghai"),
            Err(QueryError::StartAfterEnd)
        ));
    }

    #[test]
    fn absolute_range_rejects_bad_format() {
        let spec = TimeSpec::AbsoluteRange {
            start: "not-a-date".to_string(),
            end: "2026-01-01 00:00".to_string(),
            timezone: None,
        };
        let now = Utc::now();
        assert!(matches!(
            spec.normalize(now, "Asia/Shanghai"),
            Err(QueryError::InvalidTimeFormat(_))
        ));
    }
}
