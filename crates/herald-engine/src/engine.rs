//! Engine assembly: the single-writer state, timer wiring, the queue
//! processor, and boot-time recovery.
//!
//! The engine is one actor guarded by one mutex. Every entry point —
//! control call, timer fire, queue step, retry — locks for its whole
//! critical section, including the remote publish call, so all
//! operations are serialized and at most one publish runs at a time.
//! The inter-publish spacing sleeps outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use herald_core::config::HeraldConfig;
use herald_core::publish::{EventPublisher, SlotExpander};
use herald_core::types::{Profile, ProfileId};
use herald_store::{AutomationStateStore, PendingRecord, PendingStatus, PendingStore};

use crate::control::EngineHandle;
use crate::gate::RateGate;
use crate::scheduler::{recheck_delay, TimerKind, TimerSet};
use crate::timing;
use crate::worker;

/// Fire-and-forget notifications, delivered after the corresponding
/// state change is persisted. Sent with `try_send` — a slow listener
/// loses events rather than stalling the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Missed(PendingRecord),
    Published {
        record: PendingRecord,
        event_id: String,
    },
}

pub(crate) type Shared = Arc<Mutex<EngineInner>>;

pub(crate) struct EngineInner {
    pub(crate) config: HeraldConfig,
    pub(crate) pending: PendingStore,
    pub(crate) state: AutomationStateStore,
    pub(crate) profiles: HashMap<ProfileId, Profile>,
    pub(crate) timers: TimerSet,
    pub(crate) gate: RateGate,
    /// True while a queue-processor task is alive.
    pub(crate) processing: bool,
    pub(crate) publisher: Arc<dyn EventPublisher>,
    pub(crate) expander: Arc<dyn SlotExpander>,
    pub(crate) events_tx: Option<mpsc::Sender<EngineEvent>>,
    /// Self reference so `&mut self` methods can spawn timer tasks.
    pub(crate) shared: Weak<Mutex<EngineInner>>,
}

/// Entry point: loads both documents, recovers missed records, and
/// schedules the survivors.
pub struct Engine;

impl Engine {
    /// Bring the engine up. `profiles` is the caller's current profile
    /// set; it can be refreshed later through the control API.
    ///
    /// No clean-shutdown counterpart exists on purpose: the next boot's
    /// normalization and missed detection recover whatever a crash left.
    pub async fn init(
        config: HeraldConfig,
        profiles: Vec<Profile>,
        expander: Arc<dyn SlotExpander>,
        publisher: Arc<dyn EventPublisher>,
        events_tx: Option<mpsc::Sender<EngineEvent>>,
    ) -> EngineHandle {
        let now = Utc::now();
        let profile_map: HashMap<ProfileId, Profile> =
            profiles.into_iter().map(|p| (p.id(), p)).collect();

        let pending = PendingStore::load(&config.store.pending_path, now, |rec| {
            profile_map
                .get(&ProfileId::new(
                    rec.target_id.clone(),
                    rec.profile_key.clone(),
                ))
                .and_then(|p| timing::publish_time_for_start(rec.event_starts_at, p))
        });
        let state = AutomationStateStore::load(&config.store.state_path);
        let gate = RateGate::new(&config.rate);

        let shared: Shared = Arc::new_cyclic(|weak| {
            Mutex::new(EngineInner {
                config,
                pending,
                state,
                profiles: profile_map,
                timers: TimerSet::default(),
                gate,
                processing: false,
                publisher,
                expander,
                events_tx,
                shared: weak.clone(),
            })
        });

        shared.lock().await.startup(now);
        EngineHandle::new(shared)
    }
}

impl EngineInner {
    pub(crate) fn profile(&self, target_id: &str, profile_key: &str) -> Option<&Profile> {
        self.profiles
            .get(&ProfileId::new(target_id.to_string(), profile_key.to_string()))
    }

    pub(crate) fn notify(&self, event: EngineEvent) {
        if let Some(tx) = &self.events_tx {
            // try_send never blocks the engine; log a warning if the
            // listener fell behind.
            if tx.try_send(event).is_err() {
                warn!("engine event channel full or closed — notification dropped");
            }
        }
    }

    pub(crate) fn persist_pending(&mut self) {
        if let Err(e) = self.pending.save() {
            warn!(error = %e, "failed to persist pending document — in-memory state continues");
        }
    }

    pub(crate) fn persist_state(&mut self) {
        if let Err(e) = self.state.save() {
            warn!(error = %e, "failed to persist automation state — in-memory state continues");
        }
    }

    /// Boot-time recovery: flip past-due scheduled records to missed
    /// before any timer exists, then schedule the rest. Queued records
    /// were already due when the process stopped and re-enter the gate
    /// directly.
    fn startup(&mut self, now: DateTime<Utc>) {
        let past_due: Vec<String> = self
            .pending
            .pending()
            .iter()
            .filter(|r| {
                r.status == PendingStatus::Scheduled
                    && r.scheduled_publish_time.is_some_and(|p| p <= now)
            })
            .map(|r| r.id.clone())
            .collect();
        let missed = past_due.len();
        for id in &past_due {
            self.mark_missed(id, now);
        }

        let scheduled: Vec<String> = self
            .pending
            .pending()
            .iter()
            .filter(|r| r.status == PendingStatus::Scheduled)
            .map(|r| r.id.clone())
            .collect();
        for id in &scheduled {
            self.schedule_record(id, now);
        }

        let queued: Vec<(String, String, DateTime<Utc>)> = self
            .pending
            .pending()
            .iter()
            .filter(|r| r.status == PendingStatus::Queued)
            .map(|r| (r.id.clone(), r.target_id.clone(), r.event_starts_at))
            .collect();
        let requeued = queued.len();
        for (id, target, starts_at) in queued {
            self.gate.queue.push(&id, &target, starts_at);
        }
        self.ensure_processor();

        info!(
            scheduled = scheduled.len(),
            missed, requeued, "engine initialized"
        );
    }

    /// (Re)arm the timer for a scheduled record; a past-due publish time
    /// flips it to missed instead.
    pub(crate) fn schedule_record(&mut self, id: &str, now: DateTime<Utc>) {
        let Some(rec) = self.pending.get(id) else {
            return;
        };
        if rec.status != PendingStatus::Scheduled {
            return;
        }
        let Some(publish_at) = rec.scheduled_publish_time else {
            warn!(slot = id, "scheduled record has no publish time — skipping");
            return;
        };
        let delay = publish_at - now;
        if delay <= chrono::Duration::zero() {
            self.mark_missed(id, now);
            return;
        }
        let (sleep_for, kind) = recheck_delay(delay);
        debug!(slot = id, kind = ?kind, sleep_secs = sleep_for.num_seconds(), "timer armed");
        self.spawn_timer(id, sleep_for, kind);
    }

    fn spawn_timer(&mut self, id: &str, sleep_for: chrono::Duration, kind: TimerKind) {
        let weak = self.shared.clone();
        let slot_id = id.to_string();
        let dur = sleep_for.to_std().unwrap_or_default();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            let Some(shared) = weak.upgrade() else { return };
            on_timer_fired(shared, slot_id, kind).await;
        });
        self.timers.insert(id, handle);
    }

    pub(crate) fn mark_missed(&mut self, id: &str, now: DateTime<Utc>) {
        self.timers.cancel(id);
        let snapshot = match self.pending.get_mut(id) {
            Some(rec) => {
                rec.status = PendingStatus::Missed;
                rec.missed_at = Some(now);
                rec.clone()
            }
            None => return,
        };
        info!(slot = id, "publish window passed — record missed");
        self.persist_pending();
        self.notify(EngineEvent::Missed(snapshot));
    }

    /// Drop every engine-side trace of a slot: its timer and its queue
    /// entry. Synchronous — nothing fires for the slot after this.
    pub(crate) fn cancel_slot(&mut self, id: &str) {
        self.timers.cancel(id);
        self.gate.queue.remove(id);
    }

    pub(crate) fn enqueue_publish(&mut self, id: &str) {
        let (rid, target, starts_at) = match self.pending.get(id) {
            Some(rec) if rec.status.is_active() => {
                (rec.id.clone(), rec.target_id.clone(), rec.event_starts_at)
            }
            _ => return,
        };
        self.gate.queue.push(&rid, &target, starts_at);
        self.ensure_processor();
    }

    /// Start the queue-processor task unless one is already running.
    pub(crate) fn ensure_processor(&mut self) {
        if self.processing || self.gate.queue.is_empty() {
            return;
        }
        self.processing = true;
        let weak = self.shared.clone();
        tokio::spawn(async move {
            run_queue(weak).await;
        });
    }

    /// One decision for the processor: run the head, wait for the gate,
    /// or go idle. Clears `processing` on the latter two.
    fn next_queue_step(&mut self, now: DateTime<Utc>) -> QueueStep {
        loop {
            let head = match self.gate.queue.peek() {
                Some(h) => (h.id.clone(), h.target_id.clone()),
                None => {
                    self.processing = false;
                    return QueueStep::Idle;
                }
            };
            // Entries whose record vanished (cancel, purge) are stale.
            if self.pending.get(&head.0).is_none() {
                self.gate.queue.remove(&head.0);
                continue;
            }
            if self.gate.admit(&head.1, now) {
                match self.gate.queue.pop() {
                    Some(entry) => return QueueStep::Run(entry.id),
                    None => continue,
                }
            }
            let spacing = chrono::Duration::milliseconds(self.config.rate.spacing_ms as i64);
            let wake_at = self.gate.next_admit_at(&head.1, now).unwrap_or(now) + spacing;
            debug!(target = %head.1, wake_at = %wake_at, "queue head rate-limited — processor parked");
            self.spawn_gate_wake(wake_at);
            self.processing = false;
            return QueueStep::Wait;
        }
    }

    fn spawn_gate_wake(&self, at: DateTime<Utc>) {
        let weak = self.shared.clone();
        let dur = (at - Utc::now()).to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            let Some(shared) = weak.upgrade() else { return };
            shared.lock().await.ensure_processor();
        });
    }

    /// Single delayed retry after a transient publish failure — a direct
    /// worker call, not a trip through the recheck ladder.
    pub(crate) fn spawn_retry(&self, id: &str) {
        let weak = self.shared.clone();
        let delay = std::time::Duration::from_secs(self.config.rate.retry_delay_secs);
        let slot_id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else { return };
            let mut inner = shared.lock().await;
            worker::execute(&mut inner, &slot_id).await;
        });
    }

    /// Title as the remote would see it: override first, then profile.
    pub(crate) fn resolved_title(&self, rec: &PendingRecord) -> Option<String> {
        rec.manual_overrides
            .as_ref()
            .and_then(|o| o.title.clone())
            .or_else(|| {
                self.profile(&rec.target_id, &rec.profile_key)
                    .map(|p| p.title.clone())
            })
    }
}

enum QueueStep {
    Idle,
    Wait,
    Run(String),
}

async fn on_timer_fired(shared: Shared, id: String, kind: TimerKind) {
    let mut inner = shared.lock().await;
    inner.timers.discard(&id);
    match kind {
        // Outer tiers re-enter scheduling: after a long suspend the
        // publish time reads as past and the record goes missed here.
        TimerKind::Recheck => inner.schedule_record(&id, Utc::now()),
        TimerKind::Exact => inner.enqueue_publish(&id),
    }
}

/// Queue-processor task: executes admissible heads one at a time with
/// the configured spacing in between; parks itself when the head's
/// target is rate-limited.
async fn run_queue(weak: Weak<Mutex<EngineInner>>) {
    loop {
        let Some(shared) = weak.upgrade() else { return };
        let (step, spacing_ms) = {
            let mut inner = shared.lock().await;
            let step = inner.next_queue_step(Utc::now());
            (step, inner.config.rate.spacing_ms)
        };
        match step {
            QueueStep::Idle | QueueStep::Wait => return,
            QueueStep::Run(id) => {
                {
                    let mut inner = shared.lock().await;
                    worker::execute(&mut inner, &id).await;
                }
                // Spacing sleeps outside the lock.
                tokio::time::sleep(std::time::Duration::from_millis(spacing_ms)).await;
            }
        }
    }
}
