//! Discrete-event substrate the overlay runs on.
//!
//! - **VirtualTime**: clock that only advances when the scheduler pops an event
//! - **SimulationRng**: seeded RNG for every random decision in a run
//! - **Scheduler**: priority queue of future events, ordered by time then insertion

pub mod rng;
pub mod scheduler;
pub mod time;

pub use rng::SimulationRng;
pub use scheduler::{Event, EventId, Scheduler, SchedulerConfig};
pub use time::{RealTime, TimeSource, VirtualTime};
