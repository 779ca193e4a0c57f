//! Rate-limit gate and publish queue.
//!
//! Each target carries a sliding-window counter of recent publishes, a
//! lock deadline, and a back-off index. Records waiting to publish go
//! through one priority queue for the whole engine, ordered by event
//! start (soonest first, FIFO on ties). The queue processor runs at most
//! one publish at a time; pacing and wake-ups are the engine's job.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use herald_core::config::RateConfig;

/// Per-target sliding window + back-off state.
#[derive(Debug, Default)]
pub struct TargetWindow {
    history: VecDeque<DateTime<Utc>>,
    lock_until: Option<DateTime<Utc>>,
    backoff_index: usize,
}

impl TargetWindow {
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        while self
            .history
            .front()
            .is_some_and(|t| *t + window <= now)
        {
            self.history.pop_front();
        }
    }

    /// Not locked and under the window limit. An expired lock clears and
    /// resets the back-off ladder.
    fn admit(&mut self, now: DateTime<Utc>, window: Duration, limit: usize) -> bool {
        if let Some(until) = self.lock_until {
            if now < until {
                return false;
            }
            self.lock_until = None;
            self.backoff_index = 0;
        }
        self.prune(now, window);
        self.history.len() < limit
    }

    fn record_success(&mut self, now: DateTime<Utc>) {
        self.history.push_back(now);
        self.backoff_index = 0;
    }

    /// The remote said "slow down". With a full window, lock until the
    /// oldest publish ages out; otherwise walk the back-off ladder.
    fn note_rate_limit(
        &mut self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
        ladder: &[u64],
    ) {
        self.prune(now, window);
        if self.history.len() >= limit {
            if let Some(oldest) = self.history.front() {
                self.lock_until = Some(*oldest + window);
            }
        } else {
            let mins = ladder
                .get(self.backoff_index)
                .or(ladder.last())
                .copied()
                .unwrap_or(60);
            self.lock_until = Some(now + Duration::minutes(mins as i64));
            if self.backoff_index + 1 < ladder.len() {
                self.backoff_index += 1;
            }
        }
    }

    /// Earliest instant this target could be admitted again, or `None`
    /// when it is admissible right now.
    fn next_admit_at(&mut self, now: DateTime<Utc>, window: Duration, limit: usize) -> Option<DateTime<Utc>> {
        if let Some(until) = self.lock_until {
            if now < until {
                return Some(until);
            }
        }
        self.prune(now, window);
        if self.history.len() < limit {
            return None;
        }
        self.history.front().map(|oldest| *oldest + window)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub starts_at: DateTime<Utc>,
    pub seq: u64,
    pub id: String,
    pub target_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.starts_at, self.seq).cmp(&(other.starts_at, other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap on `(event start, enqueue order)`.
#[derive(Debug, Default)]
pub struct PublishQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    ids: HashSet<String>,
    seq: u64,
}

impl PublishQueue {
    /// Add a record; a second push for the same id is a no-op so a
    /// re-enqueued record keeps its place by event start.
    pub fn push(&mut self, id: &str, target_id: &str, starts_at: DateTime<Utc>) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.seq += 1;
        self.heap.push(Reverse(QueueEntry {
            starts_at,
            seq: self.seq,
            id: id.to_string(),
            target_id: target_id.to_string(),
        }));
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.heap.retain(|Reverse(e)| e.id != id);
        true
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.peek().map(|Reverse(e)| e)
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        let Reverse(entry) = self.heap.pop()?;
        self.ids.remove(&entry.id);
        Some(entry)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Gate over all targets plus the shared queue.
pub struct RateGate {
    window: Duration,
    limit: usize,
    ladder: Vec<u64>,
    targets: HashMap<String, TargetWindow>,
    pub queue: PublishQueue,
}

impl RateGate {
    pub fn new(config: &RateConfig) -> Self {
        Self {
            window: Duration::seconds(config.window_secs as i64),
            limit: config.window_limit,
            ladder: config.backoff_ladder_mins.clone(),
            targets: HashMap::new(),
            queue: PublishQueue::default(),
        }
    }

    fn target(&mut self, target_id: &str) -> &mut TargetWindow {
        self.targets.entry(target_id.to_string()).or_default()
    }

    pub fn admit(&mut self, target_id: &str, now: DateTime<Utc>) -> bool {
        let (window, limit) = (self.window, self.limit);
        self.target(target_id).admit(now, window, limit)
    }

    pub fn record_success(&mut self, target_id: &str, now: DateTime<Utc>) {
        self.target(target_id).record_success(now);
    }

    pub fn note_rate_limit(&mut self, target_id: &str, now: DateTime<Utc>) {
        let (window, limit) = (self.window, self.limit);
        let ladder = self.ladder.clone();
        self.target(target_id)
            .note_rate_limit(now, window, limit, &ladder);
        debug!(
            target = target_id,
            lock_until = ?self.targets[target_id].lock_until,
            "target rate-limited"
        );
    }

    pub fn next_admit_at(&mut self, target_id: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let (window, limit) = (self.window, self.limit);
        self.target(target_id).next_admit_at(now, window, limit)
    }
}
