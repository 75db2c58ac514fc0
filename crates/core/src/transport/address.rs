use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

const SCHEME: &str = "s.sim://";

/// Simulation-local integer id of a node, distinct from its ring address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SimId(pub u32);

impl SimId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Endpoint of the simulated transport: `s.sim://<id>` optionally followed by
/// a `/<path>` component when path multiplexing is enabled.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct TransportAddress {
    id: SimId,
    path: Option<String>,
}

impl TransportAddress {
    pub fn new(id: SimId) -> Self {
        Self { id, path: None }
    }

    pub fn with_path(id: SimId, path: impl Into<String>) -> Self {
        Self {
            id,
            path: Some(path.into()),
        }
    }

    pub fn id(&self) -> SimId {
        self.id
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}", self.id)?;
        if let Some(path) = &self.path {
            write!(f, "/{path}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportAddressError {
    #[error("unsupported scheme in `{0}`")]
    Scheme(String),
    #[error("invalid node id in `{0}`")]
    Id(String),
}

impl FromStr for TransportAddress {
    type Err = TransportAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| TransportAddressError::Scheme(s.to_owned()))?;
        let (id, path) = match rest.split_once('/') {
            Some((id, path)) if !path.is_empty() => (id, Some(path.to_owned())),
            Some((id, _)) => (id, None),
            None => (rest, None),
        };
        let id = id
            .parse::<u32>()
            .map_err(|_| TransportAddressError::Id(s.to_owned()))?;
        Ok(Self {
            id: SimId(id),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_pathed_forms() {
        let plain: TransportAddress = "s.sim://12".parse().unwrap();
        assert_eq!(plain, TransportAddress::new(SimId(12)));
        assert_eq!(plain.to_string(), "s.sim://12");

        let pathed: TransportAddress = "s.sim://3/p0".parse().unwrap();
        assert_eq!(pathed.id(), SimId(3));
        assert_eq!(pathed.path(), Some("p0"));
        assert_eq!(pathed.to_string(), "s.sim://3/p0");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!("b.udp://1".parse::<TransportAddress>().is_err());
        assert!("s.sim://x".parse::<TransportAddress>().is_err());
    }
}
