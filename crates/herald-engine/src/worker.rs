//! Publish worker: resolve the payload, consult the gate, call the
//! remote, and record the outcome.

use chrono::Utc;
use tracing::{debug, info, warn};

use herald_store::PendingStatus;

use crate::engine::{EngineEvent, EngineInner};

/// Outcome of one publish attempt, reported back to post-now callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishAttempt {
    Published { event_id: String },
    /// Deferred by the rate gate or bounced by the remote's limit.
    Queued,
    /// Profile vanished; the record will never publish.
    Cancelled,
    /// Record gone or already terminal.
    Skipped,
    /// Transient failure; a single delayed retry is scheduled.
    Retry { message: String },
}

/// Execute one publish attempt for `id`.
///
/// Runs under the engine lock — the remote call is awaited while holding
/// it, which is what serializes publishes engine-wide.
pub(crate) async fn execute(inner: &mut EngineInner, id: &str) -> PublishAttempt {
    let now = Utc::now();
    let Some(rec) = inner.pending.get(id).cloned() else {
        debug!(slot = id, "publish skipped — record gone");
        return PublishAttempt::Skipped;
    };
    if rec.status.is_terminal() || rec.status == PendingStatus::Deleted {
        debug!(slot = id, status = %rec.status, "publish skipped — terminal state");
        return PublishAttempt::Skipped;
    }

    // Admission: a locked or window-full target defers the record.
    if !inner.gate.admit(&rec.target_id, now) {
        if let Some(r) = inner.pending.get_mut(id) {
            r.status = PendingStatus::Queued;
            r.queued_at = Some(now);
        }
        inner.gate.queue.push(id, &rec.target_id, rec.event_starts_at);
        inner.persist_pending();
        inner.ensure_processor();
        debug!(slot = id, target = %rec.target_id, "publish deferred by rate gate");
        return PublishAttempt::Queued;
    }

    // A queued (or mid-action) record flips back to scheduled before the
    // actual call.
    if matches!(
        rec.status,
        PendingStatus::Queued | PendingStatus::Processing
    ) {
        if let Some(r) = inner.pending.get_mut(id) {
            r.status = PendingStatus::Scheduled;
        }
    }

    // Latest profile fields, overridden per record.
    let Some(profile) = inner.profile(&rec.target_id, &rec.profile_key).cloned() else {
        if let Some(r) = inner.pending.get_mut(id) {
            r.status = PendingStatus::Cancelled;
        }
        inner.cancel_slot(id);
        inner.persist_pending();
        warn!(slot = id, "profile gone at publish time — record cancelled");
        return PublishAttempt::Cancelled;
    };
    let mut details = profile.details();
    if let Some(overrides) = &rec.manual_overrides {
        overrides.merge_into(&mut details);
    }
    let starts_at = rec.event_starts_at;
    let ends_at = starts_at + chrono::Duration::minutes(details.duration_minutes);

    let publisher = inner.publisher.clone();
    match publisher
        .publish(&rec.target_id, &details, starts_at, ends_at)
        .await
    {
        Ok(published) => {
            let now = Utc::now();
            inner.gate.record_success(&rec.target_id, now);
            inner.timers.cancel(id);
            let snapshot = match inner.pending.get_mut(id) {
                Some(r) => {
                    r.status = PendingStatus::Published;
                    r.event_id = Some(published.event_id.clone());
                    r.scheduled_publish_time = None;
                    r.queued_at = None;
                    r.missed_at = None;
                    r.clone()
                }
                None => return PublishAttempt::Skipped,
            };
            inner
                .state
                .record_success(&rec.target_id, &rec.profile_key, starts_at, &published.event_id);
            inner.persist_pending();
            inner.persist_state();
            info!(slot = id, event = %published.event_id, target = %rec.target_id, "event published");
            inner.notify(EngineEvent::Published {
                record: snapshot,
                event_id: published.event_id.clone(),
            });
            PublishAttempt::Published {
                event_id: published.event_id,
            }
        }
        Err(e) if e.is_rate_limit() => {
            let now = Utc::now();
            inner.gate.note_rate_limit(&rec.target_id, now);
            if let Some(r) = inner.pending.get_mut(id) {
                r.status = PendingStatus::Queued;
                r.queued_at = Some(now);
            }
            // Priority unchanged: the queue keys on event start.
            inner.gate.queue.push(id, &rec.target_id, rec.event_starts_at);
            inner.persist_pending();
            inner.ensure_processor();
            warn!(slot = id, target = %rec.target_id, error = %e, "remote rate limit — record queued");
            PublishAttempt::Queued
        }
        Err(e) => {
            inner.spawn_retry(id);
            warn!(
                slot = id,
                error = %e,
                retry_in_secs = inner.config.rate.retry_delay_secs,
                "publish failed — single retry scheduled"
            );
            PublishAttempt::Retry {
                message: e.to_string(),
            }
        }
    }
}
