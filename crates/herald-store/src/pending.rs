//! The pending-events document: live records, the soft-delete pool,
//! and advisory display settings, persisted as one JSON file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::normalize;
use crate::records::{PendingDocument, PendingRecord, PendingStatus, StoreSettings};

/// Raw on-disk shape — records are decoded leniently, one by one, so a
/// single malformed entry never discards the rest of the file.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    deleted_events: Vec<Value>,
    #[serde(default)]
    settings: Option<StoreSettings>,
}

/// Durable store of pending records. All reads are synchronous snapshots;
/// the engine serializes every writer.
pub struct PendingStore {
    path: PathBuf,
    doc: PendingDocument,
}

impl PendingStore {
    /// Load from `path`, dropping garbage, normalizing, and writing the
    /// repaired document back only when something changed.
    ///
    /// `recompute` fills in a missing publish time from the record's
    /// profile; records it cannot plan are dropped.
    pub fn load<F>(path: impl Into<PathBuf>, now: DateTime<Utc>, recompute: F) -> Self
    where
        F: Fn(&PendingRecord) -> Option<DateTime<Utc>>,
    {
        let path = path.into();
        let (mut doc, mut repaired, mut dropped_raw) = (PendingDocument::default(), 0usize, 0usize);

        match std::fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str::<RawDocument>(&json) {
                Ok(raw) => {
                    if let Some(settings) = raw.settings {
                        doc.settings = settings;
                    }
                    for value in raw.events {
                        match normalize::repair_record(value) {
                            Some((rec, fixed)) => {
                                repaired += usize::from(fixed);
                                doc.events.push(rec);
                            }
                            None => dropped_raw += 1,
                        }
                    }
                    for value in raw.deleted_events {
                        match normalize::repair_record(value) {
                            Some((rec, fixed)) => {
                                repaired += usize::from(fixed);
                                doc.deleted_events.push(rec);
                            }
                            None => dropped_raw += 1,
                        }
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "pending document unreadable, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read pending document, starting empty"),
        }

        // A tombstone whose event start has passed is garbage.
        let before_gc = doc.deleted_events.len();
        doc.deleted_events.retain(|r| r.event_starts_at > now);
        let collected = before_gc - doc.deleted_events.len();

        let report = normalize::normalize(&mut doc, None, recompute);

        let store = Self { path, doc };
        if repaired + dropped_raw + collected > 0 || report.changed() {
            debug!(
                repaired,
                dropped_raw,
                collected,
                normalized = report.changed(),
                "pending document cleaned on load"
            );
            if let Err(e) = store.save() {
                warn!(error = %e, "failed to write back cleaned pending document");
            }
        }
        store
    }

    /// Whole-document write via temp-file-then-rename.
    pub fn save(&self) -> Result<()> {
        write_atomic(&self.path, &serde_json::to_string_pretty(&self.doc)?)
    }

    // --- live records -------------------------------------------------

    pub fn pending(&self) -> &[PendingRecord] {
        &self.doc.events
    }

    pub fn get(&self, id: &str) -> Option<&PendingRecord> {
        self.doc.events.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PendingRecord> {
        self.doc.events.iter_mut().find(|r| r.id == id)
    }

    pub fn insert(&mut self, record: PendingRecord) {
        self.doc.events.push(record);
    }

    pub fn remove(&mut self, id: &str) -> Option<PendingRecord> {
        let idx = self.doc.events.iter().position(|r| r.id == id)?;
        Some(self.doc.events.remove(idx))
    }

    /// Soft-delete: move a live record into the pool.
    pub fn move_to_deleted(&mut self, id: &str, now: DateTime<Utc>) -> Option<PendingRecord> {
        let mut rec = self.remove(id)?;
        rec.status = PendingStatus::Deleted;
        rec.deleted_at = Some(now);
        self.doc.deleted_events.push(rec.clone());
        Some(rec)
    }

    pub fn pending_for_profile(&self, target_id: &str, profile_key: &str) -> Vec<PendingRecord> {
        self.doc
            .events
            .iter()
            .filter(|r| r.matches_profile(target_id, profile_key))
            .cloned()
            .collect()
    }

    /// Every key currently claimed by a live record of this profile.
    pub fn live_keys_for_profile(&self, target_id: &str, profile_key: &str) -> HashSet<String> {
        self.doc
            .events
            .iter()
            .filter(|r| r.matches_profile(target_id, profile_key))
            .flat_map(|r| r.slot_keys().into_iter().map(String::from))
            .collect()
    }

    // --- deleted pool -------------------------------------------------

    pub fn deleted(&self) -> &[PendingRecord] {
        &self.doc.deleted_events
    }

    pub fn deleted_for_profile(&self, target_id: &str, profile_key: &str) -> Vec<PendingRecord> {
        self.doc
            .deleted_events
            .iter()
            .filter(|r| r.matches_profile(target_id, profile_key))
            .cloned()
            .collect()
    }

    pub fn remove_deleted(&mut self, id: &str) -> Option<PendingRecord> {
        let idx = self.doc.deleted_events.iter().position(|r| r.id == id)?;
        Some(self.doc.deleted_events.remove(idx))
    }

    pub fn clear_deleted_for_profile(&mut self, target_id: &str, profile_key: &str) -> usize {
        let before = self.doc.deleted_events.len();
        self.doc
            .deleted_events
            .retain(|r| !r.matches_profile(target_id, profile_key));
        before - self.doc.deleted_events.len()
    }

    // --- bulk operations ----------------------------------------------

    /// Restrict both pools to the given targets. Returns the ids of the
    /// removed live records (their timers must be cancelled) plus the
    /// total number of entries pruned.
    pub fn retain_targets(&mut self, targets: &HashSet<String>) -> (Vec<String>, usize) {
        let removed_ids: Vec<String> = self
            .doc
            .events
            .iter()
            .filter(|r| !targets.contains(&r.target_id))
            .map(|r| r.id.clone())
            .collect();
        let before = self.doc.events.len() + self.doc.deleted_events.len();
        self.doc.events.retain(|r| targets.contains(&r.target_id));
        self.doc
            .deleted_events
            .retain(|r| targets.contains(&r.target_id));
        let pruned = before - self.doc.events.len() - self.doc.deleted_events.len();
        (removed_ids, pruned)
    }

    /// Drop everything belonging to a profile. Returns removed live ids.
    pub fn purge_profile(&mut self, target_id: &str, profile_key: &str) -> Vec<String> {
        let removed_ids: Vec<String> = self
            .doc
            .events
            .iter()
            .filter(|r| r.matches_profile(target_id, profile_key))
            .map(|r| r.id.clone())
            .collect();
        self.doc
            .events
            .retain(|r| !r.matches_profile(target_id, profile_key));
        self.doc
            .deleted_events
            .retain(|r| !r.matches_profile(target_id, profile_key));
        removed_ids
    }

    // --- queries ------------------------------------------------------

    /// Snapshot for display: everything except cancelled and published
    /// records, soonest event first.
    pub fn get_pending_view(&self, target: Option<&str>) -> Vec<PendingRecord> {
        let mut view: Vec<PendingRecord> = self
            .doc
            .events
            .iter()
            .filter(|r| {
                r.matches_target(target)
                    && !matches!(
                        r.status,
                        PendingStatus::Cancelled | PendingStatus::Published
                    )
            })
            .cloned()
            .collect();
        view.sort_by_key(|r| r.event_starts_at);
        view
    }

    pub fn missed_count(&self, target: Option<&str>) -> usize {
        self.doc
            .events
            .iter()
            .filter(|r| r.matches_target(target) && r.status == PendingStatus::Missed)
            .count()
    }

    pub fn queued_count(&self, target: Option<&str>) -> usize {
        self.doc
            .events
            .iter()
            .filter(|r| r.matches_target(target) && r.status == PendingStatus::Queued)
            .count()
    }

    pub fn display_limit(&self) -> u32 {
        self.doc.settings.display_limit
    }

    pub fn set_display_limit(&mut self, limit: u32) {
        self.doc.settings.display_limit = limit;
    }
}

/// Write `content` to `path` through a sibling temp file and rename, so a
/// crash mid-write never leaves a truncated document.
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) use write_atomic as atomic_write;
