//! `herald-core` — shared domain types for the Herald publication engine.
//!
//! # Overview
//!
//! Herald turns recurring event patterns into scheduled publication jobs
//! and commits them through a rate-limited remote event API. This crate
//! holds everything the engine and the store agree on: the profile and
//! override model, deterministic slot identity, engine configuration,
//! and the narrow traits behind which the external collaborators live
//! (pattern expansion, the remote publish call, notifications).
//!
//! The engine itself lives in `herald-engine`; persistence in
//! `herald-store`.

pub mod config;
pub mod error;
pub mod publish;
pub mod slot_key;
pub mod types;

pub use config::{FirstSlotBasis, HeraldConfig};
pub use error::{HeraldError, Result};
pub use publish::{EventPublisher, PublishApiError, PublishedEvent, RemoteEvent, SlotExpander};
pub use slot_key::{is_canonical, parse_start_millis, slot_key};
pub use types::{
    AutomationSettings, EventDetails, ManualOverrides, Profile, ProfileId, RepeatMode, Slot,
    TimingMode,
};
