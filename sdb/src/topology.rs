//! CPU placement for the receiver thread.
//!
//! The registered callback runs on the receiver thread, so a slow callback
//! or a busy core delays every subsequent buffer. Pinning the thread to a
//! core the application's main flow does not use keeps wakeup latency
//! predictable.
//!
//! # Detection
//!
//! Uses `num_cpus` for the logical core count and `core_affinity` for the
//! usable core ids and for pinning.

use core_affinity::CoreId;
use serde::{Deserialize, Serialize};

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Core ids this process may be pinned to.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self {
            logical_cores,
            available_cores,
        }
    }

    /// Picks the highest-numbered available core.
    ///
    /// Returns `None` on single-core systems, where pinning would only
    /// compete with the application for the one core it has.
    #[must_use]
    pub fn select_receiver_core(&self) -> Option<usize> {
        if self.available_cores.len() < 2 {
            return None;
        }
        self.available_cores.iter().copied().max()
    }
}

/// Configuration for CPU pinning of the receiver thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuConfig {
    /// Leave placement to the OS scheduler.
    #[default]
    Disabled,
    /// Detect topology and pick a core away from core 0.
    Auto,
    /// Pin to the given core id.
    Manual(usize),
}

impl CpuConfig {
    /// Resolves the config to a concrete core, if any.
    #[must_use]
    pub fn resolve(&self) -> Option<usize> {
        match *self {
            Self::Disabled => None,
            Self::Auto => CpuTopology::detect().select_receiver_core(),
            Self::Manual(core) => Some(core),
        }
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded, `false` otherwise.
/// Pinning may fail if the core ID is invalid or the OS denies the request.
pub fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();
        assert!(topo.logical_cores > 0, "should have at least 1 logical core");
        assert!(!topo.available_cores.is_empty(), "should have available cores");
    }

    #[test]
    fn auto_selection_avoids_single_core_and_stays_in_set() {
        let single = CpuTopology {
            logical_cores: 1,
            available_cores: vec![0],
        };
        assert_eq!(single.select_receiver_core(), None);

        let quad = CpuTopology {
            logical_cores: 4,
            available_cores: vec![0, 1, 2, 3],
        };
        assert_eq!(quad.select_receiver_core(), Some(3));

        let detected = CpuTopology::detect();
        if let Some(core) = detected.select_receiver_core() {
            assert!(detected.available_cores.contains(&core));
        }
    }

    #[test]
    fn cpu_config_resolves() {
        assert_eq!(CpuConfig::Disabled.resolve(), None);
        assert_eq!(CpuConfig::Manual(5).resolve(), Some(5));
        // Auto depends on the host; it only has to pick a real core.
        if let Some(core) = CpuConfig::Auto.resolve() {
            assert!(CpuTopology::detect().available_cores.contains(&core));
        }
    }
}
