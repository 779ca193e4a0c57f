//! `herald-engine` — the automation engine behind Herald.
//!
//! # Overview
//!
//! From a profile's recurring patterns the engine materializes pending
//! records, schedules each publish in wall-clock time, and commits due
//! records through the rate-limited remote API. Everything runs as one
//! single-writer actor: timer fires, the queue processor, and every
//! control call serialize on one lock.
//!
//! # Lifecycle
//!
//! [`Engine::init`] loads both documents, normalizes them, flips
//! past-due records to missed, and arms timers for the rest. There is no
//! shutdown ceremony — the next boot recovers from whatever is on disk.
//!
//! # Flow
//!
//! ```text
//! patterns ──(expander)──► slots ──► pending records ──► timers
//!                                                          │ fire
//!                                                          ▼
//!                    priority queue ◄──(defer)── rate gate ◄┘
//!                          │ admit
//!                          ▼
//!                    publish worker ──► remote API
//!                          │ ok / rate-limit / error
//!                          ▼
//!              published / queued / retry in 15 min
//! ```

pub mod control;
pub mod engine;
pub mod error;
pub mod gate;
pub mod scheduler;
pub mod timing;
pub mod worker;

pub use control::{EngineHandle, MissedAction, MissedOutcome};
pub use engine::{Engine, EngineEvent};
pub use error::{EngineError, Result};
pub use worker::PublishAttempt;
