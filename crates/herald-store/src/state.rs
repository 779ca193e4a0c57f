//! The automation-state document: per-profile counters, the
//! activation anchor, and the published-times set.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::Result;
use crate::pending::atomic_write;
use crate::records::{ProfileState, StateDocument};

fn profile_key(target_id: &str, key: &str) -> String {
    format!("{target_id}::{key}")
}

/// Durable per-profile automation state.
pub struct AutomationStateStore {
    path: PathBuf,
    doc: StateDocument,
}

impl AutomationStateStore {
    /// Load from `path`; a missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "automation state unreadable, starting empty");
                StateDocument::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateDocument::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read automation state, starting empty");
                StateDocument::default()
            }
        };
        Self { path, doc }
    }

    pub fn save(&self) -> Result<()> {
        atomic_write(&self.path, &serde_json::to_string_pretty(&self.doc)?)
    }

    pub fn profile(&self, target_id: &str, key: &str) -> Option<&ProfileState> {
        self.doc.profiles.get(&profile_key(target_id, key))
    }

    pub fn profile_mut(&mut self, target_id: &str, key: &str) -> &mut ProfileState {
        self.doc
            .profiles
            .entry(profile_key(target_id, key))
            .or_default()
    }

    pub fn remove_profile(&mut self, target_id: &str, key: &str) -> bool {
        self.doc
            .profiles
            .remove(&profile_key(target_id, key))
            .is_some()
    }

    pub fn anchor(&self, target_id: &str, key: &str) -> Option<DateTime<Utc>> {
        self.profile(target_id, key)
            .and_then(|p| p.activation_starts_at)
    }

    /// Record a successful publish: bump the counter, remember the event,
    /// and seed the activation anchor if the profile has none yet.
    pub fn record_success(
        &mut self,
        target_id: &str,
        key: &str,
        starts_at: DateTime<Utc>,
        event_id: &str,
    ) {
        let state = self.profile_mut(target_id, key);
        state.events_created += 1;
        state.last_success = Some(Utc::now());
        state.last_event_id = Some(event_id.to_string());
        state
            .published_event_times
            .insert(starts_at.timestamp_millis());
        if state.activation_starts_at.is_none() {
            state.activation_starts_at = Some(starts_at);
        }
    }

    /// Move the anchor earlier, never later. Returns whether it changed.
    pub fn lower_anchor(&mut self, target_id: &str, key: &str, starts_at: DateTime<Utc>) -> bool {
        let state = self.profile_mut(target_id, key);
        match state.activation_starts_at {
            Some(current) if starts_at >= current => false,
            _ => {
                state.activation_starts_at = Some(starts_at);
                true
            }
        }
    }

    pub fn is_published(&self, target_id: &str, key: &str, start_millis: i64) -> bool {
        self.profile(target_id, key)
            .is_some_and(|p| p.published_event_times.contains(&start_millis))
    }

    /// Forget a published slot (reconciliation drop): frees the slot key
    /// for regeneration and keeps `events_created` equal to the number of
    /// records still known to be published.
    pub fn forget_published(&mut self, target_id: &str, key: &str, start_millis: i64) -> bool {
        let state = self.profile_mut(target_id, key);
        let removed = state.published_event_times.remove(&start_millis);
        if removed {
            state.events_created = state.events_created.saturating_sub(1);
        }
        removed
    }
}
