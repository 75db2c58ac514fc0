//! Vivaldi-style network coordinates.
//!
//! Each node keeps a point in a 2D plane plus a height; the estimated round
//! trip between two nodes is the distance between their coordinates. Every
//! measured round trip nudges the local point towards agreement.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{ring::RingAddress, simulation::SimulationRng};

const ERROR_GAIN: f64 = 0.25;
const POSITION_GAIN: f64 = 0.25;
const HEIGHT_SHARE: f64 = 0.1;
const MIN_HEIGHT: f64 = 0.01;

/// Coordinate in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
    pub height: f64,
    /// Relative error estimate in [0, 1].
    pub error: f64,
}

impl Default for Coordinates {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            height: MIN_HEIGHT,
            error: 1.0,
        }
    }
}

impl Coordinates {
    /// Estimated round trip in milliseconds.
    pub fn distance_ms(&self, other: &Coordinates) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt() + self.height + other.height
    }
}

#[derive(Debug)]
pub struct NcService {
    local: Coordinates,
    remotes: BTreeMap<RingAddress, Coordinates>,
    samples: u64,
    rng: SimulationRng,
}

impl NcService {
    pub fn new(rng: SimulationRng) -> Self {
        Self {
            local: Coordinates::default(),
            remotes: BTreeMap::new(),
            samples: 0,
            rng,
        }
    }

    pub fn local(&self) -> Coordinates {
        self.local
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Folds in one round-trip measurement to `remote`.
    pub fn sample(&mut self, remote: RingAddress, coordinates: Coordinates, rtt: Duration) {
        self.remotes.insert(remote, coordinates);
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        if rtt_ms <= 0.0 {
            return;
        }
        self.samples += 1;

        let predicted = self.local.distance_ms(&coordinates);
        let total_error = self.local.error + coordinates.error;
        let weight = if total_error > 0.0 {
            self.local.error / total_error
        } else {
            0.5
        };
        let relative = (predicted - rtt_ms).abs() / rtt_ms;
        self.local.error = (relative * ERROR_GAIN * weight
            + self.local.error * (1.0 - ERROR_GAIN * weight))
            .clamp(0.0, 1.0);

        let force = POSITION_GAIN * weight * (rtt_ms - predicted);
        let (mut ux, mut uy) = (self.local.x - coordinates.x, self.local.y - coordinates.y);
        let norm = (ux * ux + uy * uy).sqrt();
        if norm > f64::EPSILON {
            ux /= norm;
            uy /= norm;
        } else {
            let angle = self.rng.gen_f64() * std::f64::consts::TAU;
            ux = angle.cos();
            uy = angle.sin();
        }
        self.local.x += force * ux;
        self.local.y += force * uy;
        self.local.height = (self.local.height + force * HEIGHT_SHARE).max(MIN_HEIGHT);
    }

    /// Estimated round trip to a peer we have coordinates for.
    pub fn estimate(&self, remote: &RingAddress) -> Option<Duration> {
        let coordinates = self.remotes.get(remote)?;
        let ms = self.local.distance_ms(coordinates).max(0.0);
        Some(Duration::from_secs_f64(ms / 1000.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_nodes_converge_on_their_round_trip() {
        let rng = SimulationRng::new(8);
        let a_addr = RingAddress::random(&rng);
        let b_addr = RingAddress::random(&rng);
        let mut a = NcService::new(rng.child());
        let mut b = NcService::new(rng.child());
        let rtt = Duration::from_millis(100);

        for _ in 0..200 {
            let b_coords = b.local();
            a.sample(b_addr, b_coords, rtt);
            let a_coords = a.local();
            b.sample(a_addr, a_coords, rtt);
        }

        let estimate = a.local().distance_ms(&b.local());
        assert!((estimate - 100.0).abs() < 10.0, "estimate was {estimate}");
        assert!(a.estimate(&b_addr).is_some());
        assert!(a.estimate(&a_addr).is_none());
        assert_eq!(a.sample_count(), 200);
    }
}
