//! Typed event stream from the engine to its subscribers.
//!
//! Single producer, many consumers over a `tokio::sync::broadcast`
//! channel. A slow subscriber lags and loses the oldest entries of its own
//! buffer; it never blocks the engine. The terminal `done` event is always
//! the newest element, so a live subscriber cannot lose it.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{CalibrationResult, CrnResultMap, DoneReason, Phase};

/// Per-subscriber buffer depth before drop-oldest kicks in.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    Log {
        message: String,
        level: LogLevel,
    },
    State {
        phase: Phase,
        running: bool,
    },
    Countdown {
        trigger_epoch: f64,
        remaining: f64,
    },
    CrnUpdate {
        results: CrnResultMap,
    },
    Calibration(CalibrationResult),
    Done {
        reason: DoneReason,
        results: CrnResultMap,
    },
}

/// An event plus its publish timestamp (seconds since epoch). Timestamps
/// are monotonically non-decreasing within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub timestamp: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Seconds since the Unix epoch as `f64`.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    last_ts: Arc<Mutex<f64>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            last_ts: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Stamps and publishes. Send errors (no subscribers) are ignored; the
    /// engine must run identically with zero observers.
    pub fn emit(&self, kind: EventKind) {
        let timestamp = {
            let mut last = self.last_ts.lock().expect("event clock poisoned");
            let now = epoch_now().max(*last);
            *last = now;
            now
        };
        let _ = self.tx.send(EngineEvent { timestamp, kind });
    }

    /// Publishes a log line and mirrors it onto the process logger.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => log::info!("{message}"),
            LogLevel::Warning => log::warn!("{message}"),
            LogLevel::Error => log::error!("{message}"),
        }
        self.emit(EventKind::Log { message, level });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}
