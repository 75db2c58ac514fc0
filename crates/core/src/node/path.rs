use std::collections::BTreeMap;

use crate::transport::{SimId, TransportAddress};

/// Multiplexes several logical endpoints over one simulated transport, each
/// addressed as `s.sim://<id>/<path>`.
#[derive(Debug)]
pub struct PathManager {
    base: SimId,
    next_path: u32,
    edges: BTreeMap<String, usize>,
    running: bool,
}

impl PathManager {
    pub fn new(base: SimId) -> Self {
        Self {
            base,
            next_path: 0,
            edges: BTreeMap::new(),
            running: true,
        }
    }

    /// Allocates a fresh path name.
    pub fn create_path(&mut self) -> String {
        let path = format!("p{}", self.next_path);
        self.next_path += 1;
        self.edges.insert(path.clone(), 0);
        path
    }

    pub fn address_of(&self, path: &str) -> Option<TransportAddress> {
        self.edges
            .contains_key(path)
            .then(|| TransportAddress::with_path(self.base, path))
    }

    pub fn record_edge(&mut self, path: &str) {
        if let Some(count) = self.edges.get_mut(path) {
            *count += 1;
        }
    }

    pub fn edges(&self, path: &str) -> usize {
        self.edges.get(path).copied().unwrap_or(0)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_distinct_and_counted() {
        let mut pm = PathManager::new(SimId(2));
        let p0 = pm.create_path();
        let p1 = pm.create_path();
        assert_ne!(p0, p1);
        assert_eq!(
            pm.address_of(&p0).map(|a| a.to_string()),
            Some("s.sim://2/p0".to_owned())
        );
        assert!(pm.address_of("nope").is_none());

        pm.record_edge(&p1);
        pm.record_edge(&p1);
        assert_eq!(pm.edges(&p1), 2);
        assert_eq!(pm.edges(&p0), 0);

        assert!(pm.is_running());
        pm.stop();
        assert!(!pm.is_running());
    }
}
