//! Short-term memory of recently seen `event_id`s.
//!
//! Every id is recorded together with the outcome of its first submission.
//! A duplicate arriving while that first publication is still in flight waits
//! on a watch channel for the outcome instead of publishing again, so both
//! callers observe the same receipt. Records are kept for the dedup window
//! after they were first seen, then forgotten.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge};
use rand::Rng;
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;
use tracing::debug;

use crate::api::IngestResult;
use crate::time::TimeSource;

// Upper bound on queue slots inspected when looking for a capacity victim
const CAPACITY_SCAN_BUDGET: usize = 1024;

// A window too large to add to `seen_at` never runs out
fn outlived(seen_at: OffsetDateTime, window: Duration, now: OffsetDateTime) -> bool {
    seen_at
        .checked_add(window)
        .is_some_and(|expiry| expiry <= now)
}

struct DedupRecord {
    first_seen_at: OffsetDateTime,
    generation: u64,
    outcome: watch::Sender<Option<IngestResult>>,
}

impl DedupRecord {
    fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

// Insertion-ordered slots. A slot is stale once its record was removed or
// replaced by a newer generation for the same id.
struct Slot {
    seen_at: OffsetDateTime,
    event_id: String,
    generation: u64,
}

#[derive(Default)]
struct DedupState {
    records: HashMap<String, DedupRecord>,
    order: VecDeque<Slot>,
    next_generation: u64,
}

impl DedupState {
    fn is_current(&self, slot: &Slot) -> bool {
        self.records
            .get(&slot.event_id)
            .is_some_and(|record| record.generation == slot.generation)
    }

    fn evict_expired(&mut self, now: OffsetDateTime, window: Duration) -> usize {
        let mut evicted = 0;
        let mut budget = self.order.len();
        while budget > 0 {
            budget -= 1;
            let Some(slot) = self.order.front() else {
                break;
            };
            if !outlived(slot.seen_at, window, now) {
                break;
            }
            let Some(slot) = self.order.pop_front() else {
                break;
            };
            if !self.is_current(&slot) {
                continue;
            }
            let pending = self
                .records
                .get(&slot.event_id)
                .is_some_and(|record| !record.is_settled());
            if pending {
                // Look at it again one window later
                self.order.push_back(Slot { seen_at: now, ..slot });
            } else {
                self.records.remove(&slot.event_id);
                evicted += 1;
            }
        }
        evicted
    }

    fn evict_oldest_settled(&mut self) -> bool {
        let mut index = 0;
        while index < self.order.len().min(CAPACITY_SCAN_BUDGET) {
            let slot = &self.order[index];
            if !self.is_current(slot) {
                self.order.remove(index);
                continue;
            }
            let settled = self
                .records
                .get(&slot.event_id)
                .is_some_and(DedupRecord::is_settled);
            if settled {
                if let Some(slot) = self.order.remove(index) {
                    self.records.remove(&slot.event_id);
                }
                return true;
            }
            index += 1;
        }
        false
    }

    fn release(&mut self, event_id: &str, generation: u64) {
        if self
            .records
            .get(event_id)
            .is_some_and(|record| record.generation == generation)
        {
            self.records.remove(event_id);
        }
    }

    // Settled records past the window are dropped here, ahead of the sweep
    fn lookup(
        &mut self,
        event_id: &str,
        now: OffsetDateTime,
        window: Duration,
    ) -> Option<PriorOutcome> {
        let expired = self.records.get(event_id).is_some_and(|record| {
            record.is_settled() && outlived(record.first_seen_at, window, now)
        });
        if expired {
            self.records.remove(event_id);
        }

        self.records.get(event_id).map(|record| PriorOutcome {
            outcome: record.outcome.subscribe(),
        })
    }

    fn report(&self) {
        gauge!("ingest_dedup_tracked_ids").set(self.records.len() as f64);
    }
}

pub enum DedupCheck {
    /// First sighting: the holder must publish and then complete the reservation.
    Fresh(Reservation),
    Duplicate(PriorOutcome),
}

/// Exclusive right to publish one `event_id`. Dropping it without calling
/// [`Reservation::complete`] releases the id.
pub struct Reservation {
    state: Arc<Mutex<DedupState>>,
    event_id: String,
    generation: u64,
    settled: bool,
}

impl Reservation {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Records the outcome and wakes every waiting duplicate. Deferred outcomes
    /// are not retained, a resubmission after one is treated as fresh.
    pub fn complete(mut self, result: &IngestResult) {
        let mut state = lock(&self.state);
        let current = state
            .records
            .get(&self.event_id)
            .filter(|record| record.generation == self.generation);
        if let Some(record) = current {
            record.outcome.send_replace(Some(result.clone()));
            if matches!(result, IngestResult::Deferred { .. }) {
                state.records.remove(&self.event_id);
            }
        }
        state.report();
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(event_id = self.event_id, "reservation dropped before completion");
        let mut state = lock(&self.state);
        state.release(&self.event_id, self.generation);
        state.report();
    }
}

pub enum Resolution {
    Settled(IngestResult),
    /// The first submission gave up its reservation without an outcome.
    Released,
    TimedOut,
}

/// Handle on the outcome of an earlier submission of the same `event_id`.
pub struct PriorOutcome {
    outcome: watch::Receiver<Option<IngestResult>>,
}

impl PriorOutcome {
    /// Returns immediately when the first submission already settled,
    /// otherwise waits up to `timeout` for it.
    pub async fn resolve(mut self, timeout: std::time::Duration) -> Resolution {
        let settled = tokio::time::timeout(timeout, self.outcome.wait_for(Option::is_some)).await;
        match settled {
            Ok(Ok(outcome)) => match &*outcome {
                Some(result) => Resolution::Settled(result.clone()),
                None => Resolution::Released,
            },
            Ok(Err(_)) => Resolution::Released,
            Err(_) => Resolution::TimedOut,
        }
    }
}

#[derive(Clone)]
pub struct DedupTracker {
    state: Arc<Mutex<DedupState>>,
    window: Duration,
    max_entries: Option<usize>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

fn lock(state: &Mutex<DedupState>) -> MutexGuard<'_, DedupState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DedupTracker {
    pub fn new<TZ: TimeSource + Send + Sync + 'static>(
        window: Duration,
        max_entries: Option<usize>,
        timesource: TZ,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(DedupState::default())),
            window,
            max_entries,
            timesource: Arc::new(timesource),
        }
    }

    /// Atomically looks up `event_id` and reserves it when unseen. Concurrent
    /// callers for the same id never both get [`DedupCheck::Fresh`].
    pub fn check_and_record(&self, event_id: &str) -> DedupCheck {
        let now = self.timesource.now();
        let mut state = lock(&self.state);
        state.evict_expired(now, self.window);

        if let Some(prior) = state.lookup(event_id, now, self.window) {
            return DedupCheck::Duplicate(prior);
        }

        if let Some(max_entries) = self.max_entries {
            while state.records.len() >= max_entries {
                if !state.evict_oldest_settled() {
                    break;
                }
                counter!("ingest_dedup_capacity_evictions_total").increment(1);
            }
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let (outcome, _) = watch::channel(None);
        state.records.insert(
            event_id.to_string(),
            DedupRecord {
                first_seen_at: now,
                generation,
                outcome,
            },
        );
        state.order.push_back(Slot {
            seen_at: now,
            event_id: event_id.to_string(),
            generation,
        });
        state.report();

        DedupCheck::Fresh(Reservation {
            state: self.state.clone(),
            event_id: event_id.to_string(),
            generation,
            settled: false,
        })
    }

    /// Lookup without reserving: the earlier outcome for `event_id` if it is
    /// still remembered, settled or in flight.
    pub fn prior(&self, event_id: &str) -> Option<PriorOutcome> {
        let now = self.timesource.now();
        let mut state = lock(&self.state);
        let prior = state.lookup(event_id, now, self.window);
        state.report();
        prior
    }

    pub fn len(&self) -> usize {
        lock(&self.state).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops records older than the window. `check_and_record` already does
    /// this, the periodic task only bounds memory during quiet periods.
    pub fn evict_expired(&self) -> usize {
        let now = self.timesource.now();
        let mut state = lock(&self.state);
        let evicted = state.evict_expired(now, self.window);
        state.report();
        evicted
    }

    /// Runs `evict_expired` about once per minute, needs to be spawned in a
    /// separate task.
    pub async fn clean_state(&self) {
        // Jitter the interval so that replicas don't all sweep at the same time
        let interval_secs = rand::thread_rng().gen_range(60..70);

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let evicted = self.evict_expired();
            debug!(evicted, "dedup state cleaned");
        }
    }
}
