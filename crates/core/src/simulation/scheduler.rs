//! Deterministic event scheduler.
//!
//! Events are processed in order of:
//! 1. Event timestamp (earlier first)
//! 2. Event ID (registration order)

use std::{cmp::Ordering, collections::BinaryHeap, fmt, time::Duration};

use super::{
    rng::SimulationRng,
    time::{nanos, TimeSource, VirtualTime},
};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A scheduled event carrying a payload of type `E`.
#[derive(Debug, Clone)]
pub struct Event<E> {
    /// When this event should be processed (virtual nanos)
    pub timestamp: u64,
    pub id: EventId,
    pub payload: E,
}

impl<E> PartialEq for Event<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for Event<E> {}

impl<E> PartialOrd for Event<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Event<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reversed so the smallest timestamp pops first
        match other.timestamp.cmp(&self.timestamp) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Whether to log events as they're processed
    pub trace_events: bool,
}

/// Priority queue of future events over a virtual clock.
///
/// All randomness used while processing events goes through [`Scheduler::rng`].
pub struct Scheduler<E> {
    time: VirtualTime,
    rng: SimulationRng,
    pending_events: BinaryHeap<Event<E>>,
    next_event_id: u64,
    processed: u64,
    config: SchedulerConfig,
}

impl<E: fmt::Debug> Scheduler<E> {
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, SchedulerConfig::default())
    }

    pub fn with_config(seed: u64, config: SchedulerConfig) -> Self {
        Self {
            time: VirtualTime::new(),
            rng: SimulationRng::new(seed),
            pending_events: BinaryHeap::new(),
            next_event_id: 0,
            processed: 0,
            config,
        }
    }

    pub fn time(&self) -> &VirtualTime {
        &self.time
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.time.now_nanos()
    }

    pub fn rng(&self) -> &SimulationRng {
        &self.rng
    }

    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_events.len()
    }

    /// Number of events popped so far.
    pub fn processed_count(&self) -> u64 {
        self.processed
    }

    /// Schedules an event at the given absolute timestamp. Timestamps in the
    /// past are clamped to now.
    pub fn schedule_at(&mut self, timestamp: u64, payload: E) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.pending_events.push(Event {
            timestamp: timestamp.max(self.now()),
            id,
            payload,
        });
        id
    }

    /// Schedules an event after the given delay from now.
    pub fn schedule_after(&mut self, delay: Duration, payload: E) -> EventId {
        let timestamp = self.now().saturating_add(nanos(delay));
        self.schedule_at(timestamp, payload)
    }

    pub fn schedule_now(&mut self, payload: E) -> EventId {
        self.schedule_at(self.now(), payload)
    }

    /// Cancels a pending event by ID. Returns true if it was still queued.
    pub fn cancel(&mut self, id: EventId) -> bool {
        let original_len = self.pending_events.len();
        self.pending_events.retain(|e| e.id != id);
        self.pending_events.len() < original_len
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.pending_events.peek().map(|e| e.timestamp)
    }

    /// Pops the next event, advancing the clock to its timestamp.
    pub fn step(&mut self) -> Option<Event<E>> {
        let event = self.pending_events.pop()?;
        self.time.advance_to(event.timestamp);
        self.processed += 1;
        if self.config.trace_events {
            tracing::trace!(
                timestamp = event.timestamp,
                id = event.id.0,
                payload = ?event.payload,
                "Processing event"
            );
        }
        Some(event)
    }

    /// Advances the clock to `target` without processing anything. Callers
    /// must ensure no event is due before `target`.
    pub fn advance_idle(&mut self, target: u64) {
        debug_assert!(self.next_event_time().map_or(true, |t| t >= target));
        self.time.advance_to(target);
    }

    /// Drops every pending event.
    pub fn drain_pending(&mut self) -> Vec<Event<E>> {
        std::mem::take(&mut self.pending_events).into_vec()
    }
}

impl<E> fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.time.now_nanos())
            .field("seed", &self.rng.seed())
            .field("pending_count", &self.pending_events.len())
            .field("processed", &self.processed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_timestamp_order() {
        let mut scheduler = Scheduler::new(42);
        scheduler.schedule_at(100, "b");
        scheduler.schedule_at(50, "a");
        scheduler.schedule_at(200, "c");

        let order: Vec<_> = std::iter::from_fn(|| scheduler.step())
            .map(|e| (e.timestamp, e.payload))
            .collect();
        assert_eq!(order, vec![(50, "a"), (100, "b"), (200, "c")]);
        assert_eq!(scheduler.now(), 200);
        assert_eq!(scheduler.processed_count(), 3);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let mut scheduler = Scheduler::new(1);
        for i in 0..5 {
            scheduler.schedule_at(10, i);
        }
        let order: Vec<_> = std::iter::from_fn(|| scheduler.step())
            .map(|e| e.payload)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn schedule_after_is_relative_to_now() {
        let mut scheduler = Scheduler::new(42);
        scheduler.schedule_at(1_000, "first");
        scheduler.step();
        scheduler.schedule_after(Duration::from_nanos(500), "second");
        let e = scheduler.step().unwrap();
        assert_eq!(e.timestamp, 1_500);
    }

    #[test]
    fn past_timestamps_are_clamped() {
        let mut scheduler = Scheduler::new(42);
        scheduler.schedule_at(1_000, "tick");
        scheduler.step();
        scheduler.schedule_at(10, "late");
        assert_eq!(scheduler.step().unwrap().timestamp, 1_000);
    }

    #[test]
    fn cancel_removes_pending() {
        let mut scheduler = Scheduler::new(42);
        let id = scheduler.schedule_at(100, 1);
        scheduler.schedule_at(200, 2);
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert_eq!(scheduler.step().unwrap().timestamp, 200);
        assert!(scheduler.step().is_none());
    }
}
