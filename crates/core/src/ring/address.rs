use std::{fmt, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::simulation::SimulationRng;

const DISPLAY_PREFIX: &str = "ring:node:";

/// Position on the 128-bit identifier ring.
///
/// Addresses of structured nodes belong to the class whose lowest bit is
/// cleared. Arithmetic wraps, so every value is a valid point on the ring even
/// when it is not a valid node address (range bounds, for instance).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct RingAddress(u128);

impl RingAddress {
    /// Bits that encode the address class.
    pub const CLASS_MASK: u128 = 1;

    pub const fn new(raw: u128) -> Self {
        Self(raw)
    }

    /// Builds a structured-class address from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes) & !Self::CLASS_MASK)
    }

    /// Draws a random structured-class address.
    pub fn random(rng: &SimulationRng) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Hashes arbitrary bytes onto the ring.
    pub fn from_hash(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        Self::from_bytes(bytes)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn is_structured_class(&self) -> bool {
        self.0 & Self::CLASS_MASK == 0
    }

    /// Distance travelled going clockwise (increasing values) from `self` to `to`.
    pub fn clockwise_distance(&self, to: &RingAddress) -> u128 {
        to.0.wrapping_sub(self.0)
    }

    /// Shortest distance between two points in either direction.
    pub fn distance(&self, other: &RingAddress) -> Distance {
        let cw = self.clockwise_distance(other);
        let ccw = other.clockwise_distance(self);
        Distance(cw.min(ccw))
    }

    /// Whether `self` lies on the clockwise arc starting at `from` and ending
    /// at `to`, both ends included.
    pub fn is_within(&self, from: &RingAddress, to: &RingAddress) -> bool {
        from.clockwise_distance(self) <= from.clockwise_distance(to)
    }

    pub fn wrapping_add(&self, delta: u128) -> RingAddress {
        Self(self.0.wrapping_add(delta))
    }

    pub fn wrapping_sub(&self, delta: u128) -> RingAddress {
        Self(self.0.wrapping_sub(delta))
    }

    /// Short printable form used in logs.
    pub fn short(&self) -> String {
        let encoded = bs58::encode(self.to_bytes()).into_string();
        encoded.chars().take(8).collect()
    }
}

impl fmt::Display for RingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{DISPLAY_PREFIX}{}",
            bs58::encode(self.to_bytes()).into_string()
        )
    }
}

impl fmt::Debug for RingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingAddress({})", self.short())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing `ring:node:` prefix")]
    MissingPrefix,
    #[error("invalid base58 payload: {0}")]
    Encoding(#[from] bs58::decode::Error),
    #[error("expected 16 bytes, found {0}")]
    Length(usize),
}

impl FromStr for RingAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(DISPLAY_PREFIX)
            .ok_or(AddressParseError::MissingPrefix)?;
        let decoded = bs58::decode(encoded).into_vec()?;
        let bytes: [u8; 16] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| AddressParseError::Length(decoded.len()))?;
        Ok(Self(u128::from_be_bytes(bytes)))
    }
}

/// Shortest ring distance between two addresses, at most half the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(u128);

impl Distance {
    pub fn as_u128(&self) -> u128 {
        self.0
    }

    /// Distance as a fraction of the full ring, in [0, 0.5].
    pub fn as_fraction(&self) -> f64 {
        self.0 as f64 / 2f64.powi(128)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.as_fraction())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_addresses_are_structured() {
        let rng = SimulationRng::new(3);
        for _ in 0..64 {
            assert!(RingAddress::random(&rng).is_structured_class());
        }
    }

    #[test]
    fn distance_wraps_around() {
        let low = RingAddress::new(10);
        let high = RingAddress::new(u128::MAX - 9);
        assert_eq!(low.distance(&high).as_u128(), 20);
        assert_eq!(high.distance(&low).as_u128(), 20);
        assert_eq!(high.clockwise_distance(&low), 20);
        assert_eq!(low.clockwise_distance(&high), u128::MAX - 19);
    }

    #[test]
    fn arcs_include_both_ends() {
        let from = RingAddress::new(u128::MAX - 4);
        let to = RingAddress::new(5);
        assert!(from.is_within(&from, &to));
        assert!(to.is_within(&from, &to));
        assert!(RingAddress::new(0).is_within(&from, &to));
        assert!(!RingAddress::new(6).is_within(&from, &to));
        assert!(!RingAddress::new(u128::MAX - 5).is_within(&from, &to));
    }

    #[test]
    fn display_parses_back() {
        let rng = SimulationRng::new(11);
        let addr = RingAddress::random(&rng);
        let text = addr.to_string();
        assert!(text.starts_with(DISPLAY_PREFIX));
        assert_eq!(text.parse::<RingAddress>().unwrap(), addr);
        assert!("node:abc".parse::<RingAddress>().is_err());
    }
}
