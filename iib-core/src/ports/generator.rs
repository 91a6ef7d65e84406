//! Candidate port sets

use semver::Version;
use tracing::debug;

use crate::config::{WorkerConfig, OPM_PPROF_PORT};
use crate::error::{IibError, Result};

/// Hands out candidate port sets in order, one port per purpose
#[derive(Debug, Clone)]
pub struct PortStackGenerator {
    stacks: Vec<Vec<u16>>,
    purposes: Vec<String>,
    attempts: usize,
}

impl PortStackGenerator {
    /// Each stack holds one port per purpose, in purpose order
    pub fn new(stacks: Vec<Vec<u16>>, purposes: Vec<String>) -> Self {
        Self {
            stacks,
            purposes,
            attempts: 0,
        }
    }

    pub fn purposes(&self) -> &[String] {
        &self.purposes
    }

    /// Number of sets handed out so far
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Next unused `(purpose, port)` set
    pub fn next_set(&mut self) -> Result<Vec<(String, u16)>> {
        let Some(stack) = self.stacks.get(self.attempts) else {
            return Err(IibError::PortsExhausted {
                attempts: self.attempts,
            });
        };

        let set = self
            .purposes
            .iter()
            .cloned()
            .zip(stack.iter().copied())
            .collect();
        self.attempts += 1;
        Ok(set)
    }
}

/// Build the candidate sets for an `opm serve` invocation
///
/// The pprof purpose is dropped for opm releases that do not bind a
/// profiling port. Set `i` takes the `i`-th port of every range, so the
/// number of sets is the length of the shortest range.
pub fn opm_port_stacks(
    config: &WorkerConfig,
    purposes: &[&str],
    opm_version: &Version,
) -> Result<PortStackGenerator> {
    let pprof_min = Version::parse(&config.opm_pprof_lock_required_min_version).map_err(|e| {
        IibError::Config(format!(
            "opm_pprof_lock_required_min_version is not a semantic version: {e}"
        ))
    })?;

    let purposes: Vec<String> = purposes
        .iter()
        .filter(|purpose| **purpose != OPM_PPROF_PORT || *opm_version >= pprof_min)
        .map(|purpose| purpose.to_string())
        .collect();

    if purposes.is_empty() {
        return Ok(PortStackGenerator::new(vec![Vec::new()], purposes));
    }

    let mut ranges = Vec::with_capacity(purposes.len());
    for purpose in &purposes {
        let range = config.opm_port_ranges.get(purpose).ok_or_else(|| {
            IibError::Config(format!("No port range configured for {purpose}"))
        })?;
        ranges.push(*range);
    }

    let count = ranges
        .iter()
        .map(|(start, end)| usize::from(end.saturating_sub(*start)))
        .min()
        .unwrap_or(0);

    let stacks: Vec<Vec<u16>> = (0..count)
        .map(|offset| {
            ranges
                .iter()
                // offset < end - start, so this stays inside u16
                .map(|(start, _)| start + offset as u16)
                .collect()
        })
        .collect();

    debug!(?purposes, sets = stacks.len(), %opm_version, "Built opm port stacks");
    Ok(PortStackGenerator::new(stacks, purposes))
}
