//! Control API: the operations the UI/IPC surface invokes.
//!
//! Every method locks the engine for its whole critical section, so
//! control calls serialize against timer fires and the queue processor.
//! Queries return owned snapshots, never references into the store.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use herald_core::publish::RemoteEvent;
use herald_core::types::{ManualOverrides, Profile, ProfileId, TimingMode};
use herald_store::{PendingRecord, PendingStatus, ProfileState};

use crate::engine::Shared;
use crate::error::{EngineError, Result};
use crate::timing;
use crate::worker::{self, PublishAttempt};

/// Fallback delay when a reschedule target is already in the past.
const RESCHEDULE_GRACE_MINS: i64 = 5;

/// What to do with a missed (or otherwise stuck) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedAction {
    PostNow,
    Reschedule,
    Cancel,
}

/// Result of [`EngineHandle::act_on_missed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissedOutcome {
    Published { event_id: String },
    Queued,
    Rescheduled { publish_at: DateTime<Utc> },
    Cancelled,
    Failed { message: String },
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Shared,
}

impl EngineHandle {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    /// Restrict both pools to the given targets; `None` skips pruning.
    /// Returns the number of entries pruned (diagnostic).
    pub async fn set_known_targets(&self, targets: Option<Vec<String>>) -> usize {
        let Some(ids) = targets else { return 0 };
        let mut inner = self.shared.lock().await;
        let set: HashSet<String> = ids.into_iter().collect();
        let (removed, pruned) = inner.pending.retain_targets(&set);
        for id in &removed {
            inner.cancel_slot(id);
        }
        inner.profiles.retain(|pid, _| set.contains(&pid.target_id));
        if pruned > 0 {
            inner.persist_pending();
        }
        info!(pruned, "known targets registered");
        pruned
    }

    /// Rebuild the pending set for one profile from its patterns.
    ///
    /// Manually edited and published records survive; everything else is
    /// regenerated from a fresh expansion, filtered by the activation
    /// anchor and by slot keys already claimed (edited, published, or
    /// tombstoned). Returns the number of records created.
    pub async fn update_pending_for_profile(&self, profile: Profile) -> usize {
        let mut inner = self.shared.lock().await;
        let now = Utc::now();
        let target = profile.target_id.clone();
        let key = profile.profile_key.clone();

        for rec in inner.pending.pending_for_profile(&target, &key) {
            if !rec.has_overrides() && rec.status != PendingStatus::Published {
                inner.cancel_slot(&rec.id);
                inner.pending.remove(&rec.id);
            }
        }

        inner.profiles.insert(profile.id(), profile.clone());

        if !profile.automation.enabled {
            inner.persist_pending();
            debug!(target = %target, profile = %key, "automation disabled — pending cleared");
            return 0;
        }

        // Anchor: stored state first, else derived from the earliest
        // surviving pending slot and persisted.
        let mut anchor = inner.state.anchor(&target, &key);
        if anchor.is_none() {
            let earliest = inner
                .pending
                .pending_for_profile(&target, &key)
                .iter()
                .map(|r| r.event_starts_at)
                .min();
            if let Some(first) = earliest {
                inner.state.lower_anchor(&target, &key, first);
                inner.persist_state();
                anchor = Some(first);
            }
        }

        let slots = inner.expander.expand(
            &profile.patterns,
            inner.config.automation.months_ahead,
            &profile.timezone,
        );
        let live_keys = inner.pending.live_keys_for_profile(&target, &key);
        let deleted_keys: HashSet<String> = inner
            .pending
            .deleted_for_profile(&target, &key)
            .iter()
            .flat_map(|r| r.slot_keys().into_iter().map(String::from))
            .collect();

        let mut slots: Vec<_> = slots
            .into_iter()
            .filter(|s| anchor.map_or(true, |a| s.starts_at > a))
            .filter(|s| {
                let k = herald_core::slot_key(&target, &key, s.starts_at);
                !live_keys.contains(&k)
                    && !deleted_keys.contains(&k)
                    && !inner
                        .state
                        .is_published(&target, &key, s.starts_at.timestamp_millis())
            })
            .collect();
        slots.sort_by_key(|s| s.starts_at);
        slots.dedup_by_key(|s| s.starts_at);

        let live_active = inner
            .pending
            .pending_for_profile(&target, &key)
            .iter()
            .filter(|r| r.status.is_active())
            .count();
        let mut budget = inner
            .config
            .automation
            .max_materialized_per_profile
            .saturating_sub(live_active);
        if profile.automation.repeat_mode == herald_core::RepeatMode::Count {
            let created = inner
                .state
                .profile(&target, &key)
                .map_or(0, |s| s.events_created) as usize;
            budget = budget.min(
                (profile.automation.repeat_count as usize).saturating_sub(created + live_active),
            );
        }
        slots.truncate(budget);

        let settings = &profile.automation;
        let planned: Vec<(DateTime<Utc>, DateTime<Utc>)> = match settings.timing_mode {
            TimingMode::After => {
                let last_success = inner
                    .state
                    .profile(&target, &key)
                    .and_then(|s| s.last_success);
                timing::plan_after_slots(
                    &slots,
                    settings,
                    Duration::minutes(profile.duration_minutes),
                    last_success,
                    now,
                    inner.config.automation.first_slot_basis,
                )
                .into_iter()
                .map(|p| (p.slot.starts_at, p.publish_at))
                .collect()
            }
            TimingMode::Before => slots
                .iter()
                .map(|s| (s.starts_at, timing::publish_time_before(s.starts_at, settings)))
                .collect(),
            TimingMode::Monthly => {
                let tz = timing::parse_tz(&profile.timezone);
                slots
                    .iter()
                    .filter_map(|s| {
                        timing::publish_time_monthly(s.starts_at, settings, tz)
                            .map(|p| (s.starts_at, p))
                    })
                    .collect()
            }
        };

        let created = planned.len();
        for (starts_at, publish_at) in planned {
            let rec = PendingRecord::new(&target, &key, starts_at, publish_at);
            let id = rec.id.clone();
            inner.pending.insert(rec);
            inner.schedule_record(&id, now);
        }
        inner.persist_pending();
        info!(target = %target, profile = %key, created, "pending events rebuilt for profile");
        created
    }

    /// A manually created event activates (or back-dates) the profile:
    /// the anchor only ever moves earlier.
    pub async fn record_manual_event(
        &self,
        target_id: &str,
        profile_key: &str,
        starts_at: DateTime<Utc>,
    ) {
        let mut inner = self.shared.lock().await;
        if inner.state.lower_anchor(target_id, profile_key, starts_at) {
            inner.persist_state();
            debug!(target = target_id, profile = profile_key, anchor = %starts_at, "activation anchor lowered");
        }
    }

    /// Drop published records that no longer exist on the remote.
    ///
    /// A record survives when its event id appears in `remote`; a record
    /// with no stored id may match by start instant, ties broken by
    /// title. A record whose stored id is absent from the remote is
    /// dropped, freeing its slot key and its published-times entry so a
    /// later expansion can regenerate the slot.
    pub async fn reconcile_published(&self, target_id: &str, remote: &[RemoteEvent]) -> usize {
        let mut inner = self.shared.lock().await;
        let known_ids: HashSet<&str> = remote.iter().map(|e| e.event_id.as_str()).collect();
        let published: Vec<PendingRecord> = inner
            .pending
            .pending()
            .iter()
            .filter(|r| r.target_id == target_id && r.status == PendingStatus::Published)
            .cloned()
            .collect();

        let mut dropped = 0;
        let mut adopted = 0;
        for rec in published {
            let keep = match rec.event_id.as_deref() {
                // A stored id is authoritative: present in the real list
                // or the event is gone.
                Some(eid) => known_ids.contains(eid),
                // No stored id: fall back to the start instant, ties
                // broken by title.
                None => {
                    let candidates: Vec<&RemoteEvent> = remote
                        .iter()
                        .filter(|e| e.starts_at == rec.event_starts_at)
                        .collect();
                    let matched = match candidates.len() {
                        0 => None,
                        1 => Some(candidates[0]),
                        _ => {
                            let title = inner.resolved_title(&rec);
                            candidates
                                .into_iter()
                                .find(|c| title.is_some() && c.title == title)
                        }
                    };
                    match matched {
                        Some(real) => {
                            if let Some(r) = inner.pending.get_mut(&rec.id) {
                                r.event_id = Some(real.event_id.clone());
                                adopted += 1;
                            }
                            true
                        }
                        None => false,
                    }
                }
            };
            if !keep {
                inner.pending.remove(&rec.id);
                inner.state.forget_published(
                    target_id,
                    &rec.profile_key,
                    rec.event_starts_at.timestamp_millis(),
                );
                dropped += 1;
            }
        }
        if dropped + adopted > 0 {
            inner.persist_pending();
            if dropped > 0 {
                inner.persist_state();
            }
            info!(target = target_id, dropped, adopted, "published records reconciled against remote");
        }
        dropped
    }

    /// Attach (or replace) manual overrides on a record. Moving the event
    /// start recomputes the publish time and re-classifies the record.
    pub async fn apply_overrides(&self, id: &str, overrides: ManualOverrides) -> Result<()> {
        let mut inner = self.shared.lock().await;
        let now = Utc::now();
        let Some(rec) = inner.pending.get(id).cloned() else {
            return Err(EngineError::NotFound { id: id.to_string() });
        };
        if rec.status.is_terminal() {
            return Err(EngineError::NotAllowed {
                reason: format!("cannot override a {} record", rec.status),
            });
        }

        let old_start = rec.event_starts_at;
        let new_start = overrides.event_starts_at.unwrap_or(old_start);
        if let Some(r) = inner.pending.get_mut(id) {
            r.manual_overrides = if overrides.is_empty() {
                None
            } else {
                Some(overrides.clone())
            };
        }

        if new_start != old_start {
            let profile = inner.profile(&rec.target_id, &rec.profile_key).cloned();
            let publish_at = match &profile {
                // Before-mode keys off the event start, so recompute.
                Some(p) if p.automation.timing_mode == TimingMode::Before => {
                    timing::publish_time_before(new_start, &p.automation)
                }
                // Other modes preserve the original start→publish delta.
                _ => match rec.scheduled_publish_time {
                    Some(old_publish) => {
                        timing::clamp_publish(new_start + (old_publish - old_start), new_start)
                    }
                    None => profile
                        .as_ref()
                        .and_then(|p| timing::publish_time_for_start(new_start, p))
                        .unwrap_or_else(|| timing::clamp_publish(now, new_start)),
                },
            };
            if let Some(r) = inner.pending.get_mut(id) {
                r.event_starts_at = new_start;
                r.slot_key =
                    herald_core::slot_key(&rec.target_id, &rec.profile_key, new_start);
                r.scheduled_publish_time = Some(publish_at);
            }
            if matches!(rec.status, PendingStatus::Scheduled | PendingStatus::Missed) {
                if publish_at <= now {
                    if rec.status != PendingStatus::Missed {
                        inner.mark_missed(id, now);
                    }
                } else {
                    if let Some(r) = inner.pending.get_mut(id) {
                        r.status = PendingStatus::Scheduled;
                        r.missed_at = None;
                    }
                    inner.schedule_record(id, now);
                }
            }
        }
        inner.persist_pending();
        Ok(())
    }

    /// Act on a missed record: publish immediately, move its publish
    /// time, or soft-delete it.
    pub async fn act_on_missed(&self, id: &str, action: MissedAction) -> Result<MissedOutcome> {
        let mut inner = self.shared.lock().await;
        let now = Utc::now();
        let Some(rec) = inner.pending.get(id).cloned() else {
            return Err(EngineError::NotFound { id: id.to_string() });
        };

        match action {
            MissedAction::PostNow => {
                if matches!(
                    rec.status,
                    PendingStatus::Queued | PendingStatus::Published | PendingStatus::Cancelled
                ) {
                    return Err(EngineError::NotAllowed {
                        reason: format!("cannot post now from status {}", rec.status),
                    });
                }
                if let Some(r) = inner.pending.get_mut(id) {
                    r.status = PendingStatus::Processing;
                }
                let attempt = worker::execute(&mut inner, id).await;
                Ok(match attempt {
                    PublishAttempt::Published { event_id } => MissedOutcome::Published { event_id },
                    PublishAttempt::Queued => MissedOutcome::Queued,
                    PublishAttempt::Cancelled => MissedOutcome::Failed {
                        message: "profile missing".into(),
                    },
                    PublishAttempt::Skipped => MissedOutcome::Failed {
                        message: "record unavailable".into(),
                    },
                    PublishAttempt::Retry { message } => MissedOutcome::Failed { message },
                })
            }
            MissedAction::Reschedule => {
                let recomputed = inner
                    .profile(&rec.target_id, &rec.profile_key)
                    .filter(|p| p.automation.timing_mode == TimingMode::Before)
                    .map(|p| timing::publish_time_before(rec.event_starts_at, &p.automation));
                let publish_at = match recomputed {
                    Some(p) if p > now => p,
                    _ => now + Duration::minutes(RESCHEDULE_GRACE_MINS),
                };
                if let Some(r) = inner.pending.get_mut(id) {
                    r.status = PendingStatus::Scheduled;
                    r.scheduled_publish_time = Some(publish_at);
                    r.missed_at = None;
                    r.queued_at = None;
                }
                inner.gate.queue.remove(id);
                inner.schedule_record(id, now);
                inner.persist_pending();
                Ok(MissedOutcome::Rescheduled { publish_at })
            }
            MissedAction::Cancel => {
                inner.cancel_slot(id);
                let Some(moved) = inner.pending.move_to_deleted(id, now) else {
                    return Err(EngineError::NotFound { id: id.to_string() });
                };
                // Cancelling the last live record auto-disables the
                // profile: tombstones and automation state go with it.
                let remaining = inner
                    .pending
                    .pending_for_profile(&moved.target_id, &moved.profile_key)
                    .iter()
                    .filter(|r| r.status.is_active())
                    .count();
                if remaining == 0 {
                    inner
                        .pending
                        .clear_deleted_for_profile(&moved.target_id, &moved.profile_key);
                    inner
                        .state
                        .remove_profile(&moved.target_id, &moved.profile_key);
                    inner.persist_state();
                    info!(
                        target = %moved.target_id,
                        profile = %moved.profile_key,
                        "last pending record cancelled — automation state cleared"
                    );
                }
                inner.persist_pending();
                Ok(MissedOutcome::Cancelled)
            }
        }
    }

    /// Bring eligible tombstones back as fresh scheduled records.
    /// Returns how many were restored.
    pub async fn restore_deleted(&self, target_id: &str, profile_key: &str) -> usize {
        let mut inner = self.shared.lock().await;
        let now = Utc::now();
        let anchor = inner.state.anchor(target_id, profile_key);
        let entries = inner.pending.deleted_for_profile(target_id, profile_key);

        let mut restored = 0;
        for entry in entries {
            let starts_at = entry.event_starts_at;
            if starts_at <= now {
                continue;
            }
            if anchor.is_some_and(|a| starts_at <= a) {
                continue;
            }
            let live = inner.pending.live_keys_for_profile(target_id, profile_key);
            if entry.slot_keys().iter().any(|k| live.contains(*k)) {
                continue;
            }
            if inner
                .state
                .is_published(target_id, profile_key, starts_at.timestamp_millis())
            {
                continue;
            }
            let Some(publish_at) = inner
                .profile(target_id, profile_key)
                .and_then(|p| timing::publish_time_for_start(starts_at, p))
            else {
                continue;
            };
            if publish_at <= now {
                continue;
            }

            let mut rec = entry.clone();
            // Overrides survive only when still aligned with this slot;
            // otherwise the record comes back clean.
            let aligned = rec
                .manual_overrides
                .as_ref()
                .map_or(false, |o| o.event_starts_at.map_or(true, |s| s == starts_at));
            if !aligned {
                rec.manual_overrides = None;
            }
            rec.status = PendingStatus::Scheduled;
            rec.scheduled_publish_time = Some(publish_at);
            rec.deleted_at = None;
            rec.queued_at = None;
            rec.missed_at = None;
            rec.event_id = None;
            rec.slot_key = herald_core::slot_key(target_id, profile_key, starts_at);
            if !herald_core::is_canonical(&rec.id, target_id, profile_key) {
                rec.id = rec.slot_key.clone();
            }

            inner.pending.remove_deleted(&entry.id);
            let rid = rec.id.clone();
            inner.pending.insert(rec);
            inner.schedule_record(&rid, now);
            restored += 1;
        }
        if restored > 0 {
            inner.persist_pending();
            info!(target = target_id, profile = profile_key, restored, "tombstones restored");
        }
        restored
    }

    /// Remove every trace of a profile: timers, pending, tombstones, and
    /// automation state.
    pub async fn purge_profile(&self, target_id: &str, profile_key: &str) {
        let mut inner = self.shared.lock().await;
        let removed = inner.pending.purge_profile(target_id, profile_key);
        for id in &removed {
            inner.cancel_slot(id);
        }
        inner.state.remove_profile(target_id, profile_key);
        inner
            .profiles
            .remove(&ProfileId::new(target_id.to_string(), profile_key.to_string()));
        inner.persist_pending();
        inner.persist_state();
        info!(target = target_id, profile = profile_key, "profile purged");
    }

    // --- queries ------------------------------------------------------

    /// Display snapshot: everything except cancelled and published.
    pub async fn get_pending(&self, target: Option<&str>) -> Vec<PendingRecord> {
        self.shared.lock().await.pending.get_pending_view(target)
    }

    pub async fn get_deleted(&self, target_id: &str, profile_key: &str) -> Vec<PendingRecord> {
        self.shared
            .lock()
            .await
            .pending
            .deleted_for_profile(target_id, profile_key)
    }

    pub async fn missed_count(&self, target: Option<&str>) -> usize {
        self.shared.lock().await.pending.missed_count(target)
    }

    pub async fn queued_count(&self, target: Option<&str>) -> usize {
        self.shared.lock().await.pending.queued_count(target)
    }

    pub async fn automation_state(
        &self,
        target_id: &str,
        profile_key: &str,
    ) -> Option<ProfileState> {
        self.shared
            .lock()
            .await
            .state
            .profile(target_id, profile_key)
            .cloned()
    }

    pub async fn display_limit(&self) -> u32 {
        self.shared.lock().await.pending.display_limit()
    }

    pub async fn set_display_limit(&self, limit: u32) -> Result<()> {
        if limit == 0 {
            return Err(EngineError::InvalidInput(
                "display limit must be at least 1".into(),
            ));
        }
        let mut inner = self.shared.lock().await;
        inner.pending.set_display_limit(limit);
        inner.persist_pending();
        Ok(())
    }
}
