//! `herald-store` — durable state for the Herald publication engine.
//!
//! Two whole-document JSON files, each rewritten atomically
//! (write-to-temp-then-rename) on every save:
//!
//! - the **pending document**: live pending records, the soft-deleted
//!   pool, and advisory display settings;
//! - the **state document**: per-profile automation counters, the
//!   activation anchor, and the set of already-published event starts.
//!
//! Loading is lenient by design — malformed records are repaired where
//! possible and dropped (with a logged count) where not, so a partially
//! corrupted file never takes the engine down. Normalization runs on
//! every load and is idempotent.

pub mod error;
pub mod normalize;
pub mod pending;
pub mod records;
pub mod state;

pub use error::{Result, StoreError};
pub use normalize::NormalizeReport;
pub use pending::PendingStore;
pub use records::{
    PendingDocument, PendingRecord, PendingStatus, ProfileState, StateDocument, StoreSettings,
};
pub use state::AutomationStateStore;
