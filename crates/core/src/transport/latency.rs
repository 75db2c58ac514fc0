use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::SimId;

/// One-way delay between simulated endpoints.
///
/// With a matrix loaded, the delay between ids `a` and `b` is
/// `matrix[a % n][b % n]` milliseconds; otherwise every hop costs the base
/// latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMap {
    base: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    matrix: Option<Vec<Vec<u32>>>,
}

impl LatencyMap {
    pub fn uniform(base: Duration) -> Self {
        Self { base, matrix: None }
    }

    pub fn from_matrix(base: Duration, matrix: Vec<Vec<u32>>) -> anyhow::Result<Self> {
        let n = matrix.len();
        if n == 0 {
            anyhow::bail!("latency matrix is empty");
        }
        if let Some(row) = matrix.iter().position(|row| row.len() != n) {
            anyhow::bail!("latency matrix row {row} does not have {n} columns");
        }
        Ok(Self {
            base,
            matrix: Some(matrix),
        })
    }

    /// Loads a square JSON matrix of millisecond delays.
    pub fn load(base: Duration, path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading latency map {}", path.display()))?;
        let matrix: Vec<Vec<u32>> = serde_json::from_str(&content)
            .with_context(|| format!("parsing latency map {}", path.display()))?;
        Self::from_matrix(base, matrix)
    }

    pub fn latency(&self, from: SimId, to: SimId) -> Duration {
        match &self.matrix {
            Some(matrix) => {
                let n = matrix.len();
                Duration::from_millis(u64::from(matrix[from.as_usize() % n][to.as_usize() % n]))
            }
            None => self.base,
        }
    }

    /// Delay of a path that goes through an intermediate relay.
    pub fn relayed(&self, from: SimId, via: SimId, to: SimId) -> Duration {
        self.latency(from, via) + self.latency(via, to)
    }
}

impl Default for LatencyMap {
    fn default() -> Self {
        Self::uniform(Duration::from_millis(crate::config::DEFAULT_BASE_LATENCY_MS))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn matrix_indexes_wrap() -> anyhow::Result<()> {
        let map = LatencyMap::from_matrix(
            Duration::from_millis(1),
            vec![vec![0, 10, 20], vec![10, 0, 30], vec![20, 30, 0]],
        )?;
        assert_eq!(map.latency(SimId(0), SimId(2)), Duration::from_millis(20));
        assert_eq!(map.latency(SimId(4), SimId(5)), Duration::from_millis(30));
        assert_eq!(
            map.relayed(SimId(0), SimId(1), SimId(2)),
            Duration::from_millis(40)
        );
        Ok(())
    }

    #[test]
    fn rejects_ragged_matrix() {
        assert!(LatencyMap::from_matrix(Duration::ZERO, vec![vec![1, 2], vec![3]]).is_err());
        assert!(LatencyMap::from_matrix(Duration::ZERO, vec![]).is_err());
    }

    #[test]
    fn loads_from_json_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "[[0, 7], [7, 0]]")?;
        let map = LatencyMap::load(Duration::from_millis(1), file.path())?;
        assert_eq!(map.latency(SimId(0), SimId(1)), Duration::from_millis(7));
        Ok(())
    }
}
