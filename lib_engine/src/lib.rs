//! # OBS Registration Engine
//!
//! Core engine that fires course add/drop requests at the OBS student
//! information system the instant the registration window opens.
//!
//! The engine measures the server clock through `Date` header second
//! boundaries, computes a latency-compensated trigger instant, busy-waits
//! to it, then drives the attempt loop under the server's debounce rules
//! while broadcasting typed progress events to any number of subscribers.

// Declare the modules to re-export
pub mod attempt;
pub mod calibrate;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod schedule;
pub mod token;
pub mod wire;

// Re-export the surface the façade and CLI consume
pub use calibrate::{CalibrationHistory, Calibrator};
pub use cancel::CancelFlag;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{CalibrationError, ConfigError, EngineError};
pub use events::{EngineEvent, EventBus, EventKind, LogLevel};
pub use model::{
    CalibrationResult, CalibrationSource, CrnResult, CrnStatus, DoneReason, EngineSnapshot, Phase,
};
pub use token::TokenCheck;
