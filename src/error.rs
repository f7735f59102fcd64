/// Domain errors at the HTTP query boundary (§7 "Input validation").
///
/// Internal fallible operations keep propagating through `anyhow::Result`,
/// the way the teacher does throughout; this enum exists only where a
/// caller-facing 4xx with a specific message is part of the contract.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid time format: {0}")]
    InvalidTimeFormat(String),

    #[error("start must be before end")]
    StartAfterEnd,

    #[error("{0} must be in {1}")]
    OutOfRange(String, String),

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    /// A lower-layer failure (persistence, exchange) surfaced at the query
    /// boundary. Distinct from the 4xx variants above: the HTTP layer maps
    /// this to `success=false` rather than an input-validation 4xx (§7).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
