use chrono::NaiveDate;
use thiserror::Error;

use super::types::PeriodStep;

/// Failures while reading the market data table. Data integrity is checked
/// once, up front; the simulation never sees a malformed record.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open market data '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read market data: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: expected at least {expected} columns, found {found}")]
    MissingColumns {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: cannot parse date '{value}' (expected YYYY-MM or YYYY)")]
    InvalidDate { line: usize, value: String },

    #[error("line {line}: cannot parse {field} value '{value}'")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: {field} must be positive, got {value}")]
    NonPositive {
        line: usize,
        field: &'static str,
        value: f64,
    },

    #[error("line {line}: date {date} does not come after the previous row ({previous})")]
    OutOfOrder {
        line: usize,
        date: NaiveDate,
        previous: NaiveDate,
    },

    #[error("market data contains no usable rows")]
    Empty,
}

/// Rejected configuration values, raised when a typed config record is built.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be within [0, 1], got {value}")]
    RatioOutOfRange { field: &'static str, value: f64 },

    #[error("{field} must be > 0, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be >= 0, got {value}")]
    Negative { field: &'static str, value: f64 },

    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },

    #[error("data window start {start} must be before end {end}")]
    EmptyWindow { start: i32, end: i32 },

    #[error("portfolio has no '{name}' account")]
    MissingAccount { name: String },

    #[error("year {year} is outside the supported calendar")]
    YearOutOfRange { year: i32 },
}

/// Failures of a whole backtest run (as opposed to a cohort failing, which
/// is an ordinary outcome).
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no cohort between {start} and {end} ran to completion")]
    NoCompletedCohorts { start: NaiveDate, end: NaiveDate },

    #[error("no market data for cohort start {0}")]
    MissingStart(NaiveDate),

    #[error("market data has {series:?} periods but the run uses {inputs:?} periods")]
    StepMismatch { series: PeriodStep, inputs: PeriodStep },
}
