//! Load-time repair and normalization of the pending document.
//!
//! Files written by older builds, or edited by hand, arrive in all kinds
//! of shapes. Repair works on raw JSON values (a record missing its start
//! can sometimes be saved by an override); normalization then enforces
//! slot identity and the one-record-per-slot rule on the typed document.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::records::{PendingDocument, PendingRecord, PendingStatus};

/// What a normalization pass did. `changed()` decides whether the
/// document is written back after load.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizeReport {
    pub dropped_unknown: usize,
    pub dropped_cancelled: usize,
    pub dropped_unplannable: usize,
    pub moved_to_deleted: usize,
    pub rekeyed: usize,
    pub status_reset: usize,
    pub publish_recomputed: usize,
    pub deduped: usize,
    pub deleted_pruned: usize,
}

impl NormalizeReport {
    pub fn changed(&self) -> bool {
        self.dropped_unknown
            + self.dropped_cancelled
            + self.dropped_unplannable
            + self.moved_to_deleted
            + self.rekeyed
            + self.status_reset
            + self.publish_recomputed
            + self.deduped
            + self.deleted_pruned
            > 0
    }

    pub fn dropped_total(&self) -> usize {
        self.dropped_unknown + self.dropped_cancelled + self.dropped_unplannable
    }
}

/// Best-effort decode of one raw record.
///
/// Returns the record plus whether anything had to be fixed up; `None`
/// means the record is beyond repair and is dropped.
pub fn repair_record(mut value: Value) -> Option<(PendingRecord, bool)> {
    let obj = value.as_object_mut()?;
    let mut fixed = false;

    // A missing start can be adopted from an override that supplies one.
    let start_missing = obj
        .get("eventStartsAt")
        .map_or(true, |v| v.is_null() || !v.is_string());
    if start_missing {
        let from_override = obj
            .get("manualOverrides")
            .and_then(|o| o.get("eventStartsAt"))
            .filter(|v| v.is_string())
            .cloned()?;
        obj.insert("eventStartsAt".to_string(), from_override);
        fixed = true;
    }

    // Unknown or absent status resets to scheduled.
    let status_ok = obj
        .get("status")
        .and_then(|v| v.as_str())
        .is_some_and(|s| s.parse::<PendingStatus>().is_ok());
    if !status_ok {
        obj.insert("status".to_string(), Value::String("scheduled".into()));
        fixed = true;
    }

    serde_json::from_value::<PendingRecord>(value)
        .ok()
        .map(|r| (r, fixed))
}

/// Normalize the typed document in place.
///
/// `known_targets`, when registered, prunes records belonging to targets
/// the caller no longer knows. `recompute` derives a missing publish time
/// from the record's profile; when even that is impossible the record is
/// dropped.
pub fn normalize<F>(
    doc: &mut PendingDocument,
    known_targets: Option<&HashSet<String>>,
    recompute: F,
) -> NormalizeReport
where
    F: Fn(&PendingRecord) -> Option<DateTime<Utc>>,
{
    let mut report = NormalizeReport::default();

    let mut survivors: Vec<PendingRecord> = Vec::with_capacity(doc.events.len());
    for mut rec in doc.events.drain(..) {
        if let Some(known) = known_targets {
            if !known.contains(&rec.target_id) {
                report.dropped_unknown += 1;
                continue;
            }
        }

        match rec.status {
            // Cancelled records never survive a restart.
            PendingStatus::Cancelled => {
                report.dropped_cancelled += 1;
                continue;
            }
            // Deleted records belong in the pool, not the live list.
            PendingStatus::Deleted => {
                report.moved_to_deleted += 1;
                canonicalize(&mut rec, &mut report);
                doc.deleted_events.push(rec);
                continue;
            }
            // A processing marker on disk means the process died mid-action.
            PendingStatus::Processing => {
                rec.status = PendingStatus::Scheduled;
                report.status_reset += 1;
            }
            _ => {}
        }

        if rec.scheduled_publish_time.is_none() && rec.status != PendingStatus::Published {
            match recompute(&rec) {
                Some(publish) => {
                    rec.scheduled_publish_time = Some(publish);
                    report.publish_recomputed += 1;
                }
                None => {
                    report.dropped_unplannable += 1;
                    continue;
                }
            }
        }

        canonicalize(&mut rec, &mut report);
        survivors.push(rec);
    }
    doc.events = survivors;

    dedup_pending(doc, &mut report);
    prune_deleted(doc, &mut report);

    if report.changed() {
        debug!(
            dropped = report.dropped_total(),
            moved = report.moved_to_deleted,
            rekeyed = report.rekeyed,
            deduped = report.deduped,
            deleted_pruned = report.deleted_pruned,
            "pending document normalized"
        );
    }
    report
}

/// Recompute the canonical slot key; replace a non-deterministic id.
fn canonicalize(rec: &mut PendingRecord, report: &mut NormalizeReport) {
    let canonical = herald_core::slot_key(&rec.target_id, &rec.profile_key, rec.event_starts_at);
    if rec.slot_key != canonical {
        rec.slot_key = canonical.clone();
        report.rekeyed += 1;
    }
    if !herald_core::is_canonical(&rec.id, &rec.target_id, &rec.profile_key) {
        rec.id = canonical;
        report.rekeyed += 1;
    }
}

/// Keep the highest-priority record per slot-key equivalence class.
fn dedup_pending(doc: &mut PendingDocument, report: &mut NormalizeReport) {
    let mut kept: Vec<PendingRecord> = Vec::with_capacity(doc.events.len());
    let mut claims: HashMap<String, usize> = HashMap::new();

    for rec in doc.events.drain(..) {
        let claimant = rec
            .slot_keys()
            .iter()
            .find_map(|k| claims.get(*k).copied());
        match claimant {
            None => {
                let idx = kept.len();
                for k in rec.slot_keys() {
                    claims.insert(k.to_string(), idx);
                }
                kept.push(rec);
            }
            Some(idx) => {
                report.deduped += 1;
                if rec.priority_rank() > kept[idx].priority_rank() {
                    for k in rec.slot_keys() {
                        claims.insert(k.to_string(), idx);
                    }
                    kept[idx] = rec;
                }
            }
        }
    }
    doc.events = kept;
}

/// Drop deleted entries shadowed by a live record, then dedup the pool.
fn prune_deleted(doc: &mut PendingDocument, report: &mut NormalizeReport) {
    let live_keys: HashSet<String> = doc
        .events
        .iter()
        .flat_map(|r| r.slot_keys().into_iter().map(String::from))
        .collect();

    let before = doc.deleted_events.len();
    doc.deleted_events
        .retain(|r| !r.slot_keys().iter().any(|k| live_keys.contains(*k)));
    report.deleted_pruned += before - doc.deleted_events.len();

    let mut kept: Vec<PendingRecord> = Vec::with_capacity(doc.deleted_events.len());
    let mut claims: HashMap<String, usize> = HashMap::new();
    for rec in doc.deleted_events.drain(..) {
        let claimant = rec
            .slot_keys()
            .iter()
            .find_map(|k| claims.get(*k).copied());
        match claimant {
            None => {
                let idx = kept.len();
                for k in rec.slot_keys() {
                    claims.insert(k.to_string(), idx);
                }
                kept.push(rec);
            }
            Some(idx) => {
                report.deleted_pruned += 1;
                if rec.priority_rank() > kept[idx].priority_rank() {
                    for k in rec.slot_keys() {
                        claims.insert(k.to_string(), idx);
                    }
                    kept[idx] = rec;
                }
            }
        }
    }
    doc.deleted_events = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 5, 19, 0, 0).unwrap()
    }

    fn record(status: PendingStatus) -> PendingRecord {
        let mut r = PendingRecord::new("g", "p", start(), start() - chrono::Duration::days(3));
        r.status = status;
        r
    }

    fn no_recompute(_: &PendingRecord) -> Option<DateTime<Utc>> {
        None
    }

    #[test]
    fn repair_adopts_override_start() {
        let value = json!({
            "id": "pending_g_p_0",
            "slotKey": "pending_g_p_0",
            "targetId": "g",
            "profileKey": "p",
            "status": "scheduled",
            "scheduledPublishTime": "2026-06-02T19:00:00Z",
            "manualOverrides": { "eventStartsAt": "2026-06-05T19:00:00Z" }
        });
        let (rec, fixed) = repair_record(value).unwrap();
        assert!(fixed);
        assert_eq!(rec.event_starts_at, start());
    }

    #[test]
    fn repair_resets_unknown_status() {
        let value = json!({
            "id": "x",
            "slotKey": "x",
            "targetId": "g",
            "profileKey": "p",
            "eventStartsAt": "2026-06-05T19:00:00Z",
            "status": "exploded"
        });
        let (rec, fixed) = repair_record(value).unwrap();
        assert!(fixed);
        assert_eq!(rec.status, PendingStatus::Scheduled);
    }

    #[test]
    fn repair_drops_record_with_no_start_anywhere() {
        let value = json!({
            "id": "x",
            "slotKey": "x",
            "targetId": "g",
            "profileKey": "p",
            "status": "scheduled"
        });
        assert!(repair_record(value).is_none());
    }

    #[test]
    fn cancelled_dropped_deleted_pooled() {
        let mut doc = PendingDocument {
            events: vec![record(PendingStatus::Cancelled), record(PendingStatus::Deleted)],
            ..Default::default()
        };
        let report = normalize(&mut doc, None, no_recompute);
        assert!(doc.events.is_empty());
        assert_eq!(doc.deleted_events.len(), 1);
        assert_eq!(report.dropped_cancelled, 1);
        assert_eq!(report.moved_to_deleted, 1);
    }

    #[test]
    fn missing_publish_time_recomputed_or_dropped() {
        let mut keep = record(PendingStatus::Scheduled);
        keep.scheduled_publish_time = None;
        let mut doc = PendingDocument {
            events: vec![keep],
            ..Default::default()
        };
        let publish = start() - chrono::Duration::hours(48);
        let report = normalize(&mut doc, None, |_| Some(publish));
        assert_eq!(doc.events[0].scheduled_publish_time, Some(publish));
        assert!(report.changed());

        let mut gone = record(PendingStatus::Scheduled);
        gone.scheduled_publish_time = None;
        let mut doc = PendingDocument {
            events: vec![gone],
            ..Default::default()
        };
        let report = normalize(&mut doc, None, no_recompute);
        assert!(doc.events.is_empty());
        assert_eq!(report.dropped_unplannable, 1);
    }

    #[test]
    fn nondeterministic_id_replaced_with_slot_key() {
        let mut rec = record(PendingStatus::Scheduled);
        rec.id = "legacy-uuid-1234".into();
        rec.slot_key = "wrong".into();
        let mut doc = PendingDocument {
            events: vec![rec],
            ..Default::default()
        };
        normalize(&mut doc, None, no_recompute);
        let canonical = herald_core::slot_key("g", "p", start());
        assert_eq!(doc.events[0].id, canonical);
        assert_eq!(doc.events[0].slot_key, canonical);
    }

    #[test]
    fn dedup_keeps_highest_priority() {
        let mut doc = PendingDocument {
            events: vec![
                record(PendingStatus::Missed),
                record(PendingStatus::Published),
                record(PendingStatus::Scheduled),
            ],
            ..Default::default()
        };
        let report = normalize(&mut doc, None, no_recompute);
        assert_eq!(doc.events.len(), 1);
        assert_eq!(doc.events[0].status, PendingStatus::Published);
        assert_eq!(report.deduped, 2);
    }

    #[test]
    fn deleted_entry_shadowed_by_live_record_is_pruned() {
        let mut doc = PendingDocument {
            events: vec![record(PendingStatus::Scheduled)],
            deleted_events: vec![record(PendingStatus::Deleted)],
            ..Default::default()
        };
        normalize(&mut doc, None, no_recompute);
        assert!(doc.deleted_events.is_empty());
    }

    #[test]
    fn unknown_target_pruned_when_registered() {
        let mut doc = PendingDocument {
            events: vec![record(PendingStatus::Scheduled)],
            ..Default::default()
        };
        let known: HashSet<String> = ["other".to_string()].into();
        let report = normalize(&mut doc, Some(&known), no_recompute);
        assert!(doc.events.is_empty());
        assert_eq!(report.dropped_unknown, 1);
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut doc = PendingDocument {
            events: vec![
                record(PendingStatus::Missed),
                record(PendingStatus::Scheduled),
                record(PendingStatus::Deleted),
            ],
            deleted_events: vec![record(PendingStatus::Deleted)],
            ..Default::default()
        };
        let first = normalize(&mut doc, None, no_recompute);
        assert!(first.changed());
        let second = normalize(&mut doc, None, no_recompute);
        assert!(!second.changed(), "second pass must be a no-op: {second:?}");
    }
}
