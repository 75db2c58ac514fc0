//! Layered listeners.
//!
//! A node's transport is a base simulated listener optionally wrapped by a
//! path multiplexer and a security layer. Layers are applied in order by a
//! list of [`StackStep`] functions, each taking the inner listener and
//! returning the wrapped one.

use std::fmt;

use super::{authorizer::Decision, Authorizer, SimId, TransportAddress};

/// How a relay is chosen when a direct link is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOverlap {
    /// Prefer relays close on the ring to the unreachable peer.
    Simple,
    /// Prefer relays with the lowest estimated round trip from us.
    Coordinates,
}

#[derive(Debug)]
enum Layer {
    Simulation {
        id: SimId,
        authorizer: Option<Box<dyn Authorizer>>,
    },
    Path {
        path: String,
    },
    Secure,
    Relay {
        overlap: RelayOverlap,
    },
}

#[derive(Debug)]
pub struct Listener {
    layer: Layer,
    inner: Option<Box<Listener>>,
}

/// Inputs shared by every step of a stack build.
#[derive(Debug, Clone, Default)]
pub struct StackContext {
    pub path: Option<String>,
}

pub type StackStep = fn(Listener, &StackContext) -> Listener;

impl Listener {
    /// Base listener of the simulated transport.
    pub fn simulation(id: SimId, authorizer: Option<Box<dyn Authorizer>>) -> Self {
        Self {
            layer: Layer::Simulation { id, authorizer },
            inner: None,
        }
    }

    /// Listener accepting links tunnelled through an intermediate node.
    pub fn relay(overlap: RelayOverlap) -> Self {
        Self {
            layer: Layer::Relay { overlap },
            inner: None,
        }
    }

    fn wrap(self, layer: Layer) -> Self {
        Self {
            layer,
            inner: Some(Box::new(self)),
        }
    }

    fn layers(&self) -> impl Iterator<Item = &Listener> {
        std::iter::successors(Some(self), |l| l.inner.as_deref())
    }

    /// Asks the innermost authorizer whether `remote` may link directly.
    pub fn authorize(&mut self, remote: &TransportAddress) -> Decision {
        if let Layer::Simulation { authorizer, .. } = &mut self.layer {
            return authorizer
                .as_mut()
                .map_or(Decision::Allow, |a| a.authorize(remote));
        }
        match self.inner.as_deref_mut() {
            Some(inner) => inner.authorize(remote),
            None => Decision::Allow,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.layers().any(|l| matches!(l.layer, Layer::Secure))
    }

    pub fn is_relay(&self) -> bool {
        self.relay_overlap().is_some()
    }

    pub fn relay_overlap(&self) -> Option<RelayOverlap> {
        self.layers().find_map(|l| match l.layer {
            Layer::Relay { overlap } => Some(overlap),
            _ => None,
        })
    }

    /// Endpoint other nodes reach this listener at, if it has a transport base.
    pub fn local_address(&self) -> Option<TransportAddress> {
        let id = self.layers().find_map(|l| match l.layer {
            Layer::Simulation { id, .. } => Some(id),
            _ => None,
        })?;
        let path = self.layers().find_map(|l| match &l.layer {
            Layer::Path { path } => Some(path.clone()),
            _ => None,
        });
        Some(match path {
            Some(path) => TransportAddress::with_path(id, path),
            None => TransportAddress::new(id),
        })
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for l in self.layers() {
            if !first {
                f.write_str(" > ")?;
            }
            first = false;
            match &l.layer {
                Layer::Simulation { id, authorizer } => {
                    write!(f, "sim({id}")?;
                    if authorizer.is_some() {
                        f.write_str(", broken")?;
                    }
                    f.write_str(")")?;
                }
                Layer::Path { path } => write!(f, "path({path})")?,
                Layer::Secure => f.write_str("secure")?,
                Layer::Relay { overlap } => write!(f, "relay({overlap:?})")?,
            }
        }
        Ok(())
    }
}

/// Multiplexes the inner listener under a named path.
pub fn with_pathing(inner: Listener, ctx: &StackContext) -> Listener {
    match &ctx.path {
        Some(path) => inner.wrap(Layer::Path { path: path.clone() }),
        None => inner,
    }
}

/// Requires certificate verification for every edge through this listener.
pub fn with_security(inner: Listener, _ctx: &StackContext) -> Listener {
    inner.wrap(Layer::Secure)
}

pub fn build_stack(base: Listener, steps: &[StackStep], ctx: &StackContext) -> Listener {
    steps.iter().fold(base, |listener, step| step(listener, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{simulation::SimulationRng, transport::BrokenAuthorizer};

    #[test]
    fn stack_applies_steps_in_order() {
        let steps: Vec<StackStep> = vec![with_pathing, with_security];
        let ctx = StackContext {
            path: Some("p0".into()),
        };
        let listener = build_stack(Listener::simulation(SimId(4), None), &steps, &ctx);
        assert!(listener.is_secure());
        assert!(!listener.is_relay());
        assert_eq!(listener.to_string(), "secure > path(p0) > sim(4)");
        assert_eq!(
            listener.local_address(),
            Some(TransportAddress::with_path(SimId(4), "p0"))
        );
    }

    #[test]
    fn authorization_reaches_the_base() {
        let auth = BrokenAuthorizer::new(1.0, SimulationRng::new(2));
        let mut listener = with_security(
            Listener::simulation(SimId(1), Some(Box::new(auth))),
            &StackContext::default(),
        );
        assert_eq!(
            listener.authorize(&TransportAddress::new(SimId(7))),
            Decision::Deny
        );
        assert_eq!(
            listener.authorize(&TransportAddress::new(SimId(0))),
            Decision::Allow
        );
    }

    #[test]
    fn relay_listener_has_no_transport_base() {
        let relay = with_security(
            Listener::relay(RelayOverlap::Simple),
            &StackContext::default(),
        );
        assert!(relay.is_relay());
        assert!(relay.is_secure());
        assert!(relay.local_address().is_none());
    }
}
