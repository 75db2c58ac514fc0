//! Time sources for the simulation.
//!
//! Everything inside a run is measured against [`VirtualTime`], which only moves
//! when the scheduler pops an event. [`RealTime`] is used by the binary to
//! report how long a run took on the wall clock.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Abstraction over a monotonic clock.
pub trait TimeSource: Clone {
    /// Returns the current time as nanoseconds since an arbitrary epoch.
    fn now_nanos(&self) -> u64;

    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_nanos())
    }

    /// Time elapsed since `earlier`, saturating at zero.
    fn since(&self, earlier: u64) -> Duration {
        Duration::from_nanos(self.now_nanos().saturating_sub(earlier))
    }
}

/// Wall clock, measured from construction.
#[derive(Clone, Debug)]
pub struct RealTime {
    epoch: Instant,
}

impl Default for RealTime {
    fn default() -> Self {
        Self::new()
    }
}

impl RealTime {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl TimeSource for RealTime {
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Virtual clock advanced explicitly by the scheduler.
///
/// Clones observe the same instant.
#[derive(Clone, Debug, Default)]
pub struct VirtualTime {
    current: Arc<AtomicU64>,
}

impl VirtualTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward to `target`. Moving backwards is a no-op.
    pub fn advance_to(&self, target: u64) {
        self.current.fetch_max(target, Ordering::SeqCst);
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.current
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for VirtualTime {
    fn now_nanos(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// Converts a duration to virtual nanoseconds.
pub fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_time_only_moves_forward() {
        let time = VirtualTime::new();
        assert_eq!(time.now_nanos(), 0);
        time.advance_to(500);
        time.advance_to(100);
        assert_eq!(time.now_nanos(), 500);
        time.advance(Duration::from_nanos(250));
        assert_eq!(time.now(), Duration::from_nanos(750));
        assert_eq!(time.since(700), Duration::from_nanos(50));
        assert_eq!(time.since(1_000), Duration::ZERO);
    }

    #[test]
    fn clones_share_the_clock() {
        let time = VirtualTime::new();
        let view = time.clone();
        time.advance(Duration::from_millis(3));
        assert_eq!(view.now(), Duration::from_millis(3));
    }
}
