//! Error taxonomy for the registration engine.
//!
//! Configuration and credential problems abort `start` synchronously;
//! calibration errors either retry inside the probe budget or surface once
//! no sample was ever collected; everything in between is a per-attempt
//! condition the attempt loop handles itself.

use thiserror::Error;

use crate::config::{MAX_ECRN, MIN_RETRY_INTERVAL};

/// Rejections raised while validating an [`crate::EngineConfig`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("no bearer token configured")]
    MissingToken,

    #[error("no course reference numbers configured")]
    NoCrns,

    #[error("{0:?} is not a 5-digit course reference number")]
    InvalidCrn(String),

    #[error("at most {MAX_ECRN} courses can be added per run, got {0}")]
    TooManyCourses(usize),

    #[error("invalid target time {0:?}, expected HH:MM:SS")]
    InvalidTargetTime(String),

    #[error("max attempts must be within 1..=300, got {0}")]
    AttemptBudgetOutOfRange(u32),

    #[error("retry interval {0}s is below the {MIN_RETRY_INTERVAL}s server debounce floor")]
    RetryTooAggressive(f64),

    #[error("safety buffer {0}s is outside 0.0..=0.1s")]
    BufferOutOfRange(f64),
}

/// Failures of a clock calibration measurement.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("SIS host unreachable: {0}")]
    Unreachable(String),

    #[error("probe response carried no Date header")]
    MissingDateHeader,

    #[error("no Date header second boundary observed within the measurement budget")]
    NoSecondBoundary,

    #[error("monotonic clock regression across a probe")]
    ClockRegression,

    #[error("calibration cancelled")]
    Cancelled,
}

/// Lifecycle and credential errors surfaced through the control interface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a registration run is already active")]
    AlreadyRunning,

    #[error("no registration run is active")]
    NotRunning,

    #[error("cannot reset while a run is active")]
    StillRunning,

    #[error("engine has no configuration")]
    NotConfigured,

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("bearer token rejected by the SIS (HTTP {status})")]
    TokenInvalid { status: u16 },

    #[error("bearer token is past its exp claim")]
    TokenExpired,

    #[error("run cancelled")]
    Cancelled,
}
