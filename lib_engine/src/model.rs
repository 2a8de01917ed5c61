//! Data model shared between the engine, its events, and the façade.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Engine lifecycle phase. `Done` returns to `Idle` only through an
/// explicit `Reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    TokenCheck,
    Calibrating,
    Waiting,
    Registering,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::TokenCheck => "token_check",
            Phase::Calibrating => "calibrating",
            Phase::Waiting => "waiting",
            Phase::Registering => "registering",
            Phase::Done => "done",
        }
    }
}

/// Per-course outcome as understood so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrnStatus {
    Pending,
    Success,
    AlreadyEnrolled,
    Full,
    Conflict,
    UpgradeConflict,
    Debounce,
    Dropped,
    Error,
}

impl CrnStatus {
    /// Whether a course in this state leaves the working set for good.
    ///
    /// `Full` is terminal by default; a caller may opt into keeping full
    /// courses in play to catch a freed seat.
    pub fn is_terminal(self, full_is_terminal: bool) -> bool {
        match self {
            CrnStatus::Success
            | CrnStatus::AlreadyEnrolled
            | CrnStatus::Conflict
            | CrnStatus::UpgradeConflict
            | CrnStatus::Dropped => true,
            CrnStatus::Full => full_is_terminal,
            CrnStatus::Pending | CrnStatus::Debounce | CrnStatus::Error => false,
        }
    }
}

/// Status plus the human-readable explanation shown in UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrnResult {
    pub status: CrnStatus,
    pub message: String,
}

impl CrnResult {
    pub fn new(status: CrnStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn pending() -> Self {
        Self::new(CrnStatus::Pending, "waiting")
    }
}

/// Ordered per-CRN result map; BTreeMap keeps event payloads deterministic.
pub type CrnResultMap = BTreeMap<String, CrnResult>;

/// Where a calibration measurement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    Initial,
    Auto,
    Final,
    Manual,
}

/// Aggregated calibration measurement, broadcast to subscribers.
///
/// `server_offset_ms` is server wall clock minus local wall clock at the
/// measurement instant. The NTP figures are informational only and never
/// drive the trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub server_offset_ms: f64,
    pub rtt_one_way_ms: f64,
    pub rtt_full_ms: f64,
    pub ntp_offset_ms: Option<f64>,
    pub server_ntp_diff_ms: Option<f64>,
    pub accuracy_ms: f64,
    pub source: CalibrationSource,
}

impl CalibrationResult {
    pub fn server_offset_secs(&self) -> f64 {
        self.server_offset_ms / 1000.0
    }

    pub fn rtt_one_way_secs(&self) -> f64 {
        self.rtt_one_way_ms / 1000.0
    }

    pub fn rtt_full_secs(&self) -> f64 {
        self.rtt_full_ms / 1000.0
    }
}

/// Why a run reached `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Completed,
    Exhausted,
    Cancelled,
    TokenInvalid,
    TokenExpired,
    CalibrationFailed,
}

/// Point-in-time engine state, retained after `done` until the next run
/// or an explicit reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub phase: Phase,
    pub running: bool,
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub crn_results: CrnResultMap,
    pub calibration: Option<CalibrationResult>,
    pub countdown_seconds: Option<f64>,
    pub trigger_epoch: Option<f64>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            running: false,
            current_attempt: 0,
            max_attempts: 0,
            crn_results: CrnResultMap::new(),
            calibration: None,
            countdown_seconds: None,
            trigger_epoch: None,
        }
    }
}
