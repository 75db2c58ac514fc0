//! Measurement and verification protocols driven by the simulator.

pub mod all_to_all;
pub mod broadcast;
pub mod crawl;
pub mod kv;
pub mod ring_check;

pub use all_to_all::{AllToAllHelper, AllToAllReport};
pub use broadcast::{BroadcastHelper, BroadcastReceipt, BroadcastSender, BroadcastStats};
pub use crawl::{CrawlHelper, CrawlReport};
pub use kv::{DhtGet, DhtPut};
pub use ring_check::{MissingNode, RingDefect, RingVerifier, RingWalk};
