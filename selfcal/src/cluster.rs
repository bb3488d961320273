//! Scheduler allocation discovery.
//!
//! The probe runs once, before the first cycle. Its result decides how the
//! imager is launched for the whole run.

use selfcal_types::ExecutionStrategy;
use tracing::{info, warn};

pub const SLURM_JOB_NUM_NODES: &str = "SLURM_JOB_NUM_NODES";
pub const SLURM_CPUS_ON_NODE: &str = "SLURM_CPUS_ON_NODE";
pub const SLURM_MEM_PER_NODE: &str = "SLURM_MEM_PER_NODE";

/// Hard cap on calibrator threads. Larger values can make gain
/// calibration hang on many-core machines.
pub const MAX_CALIBRATOR_THREADS: u32 = 16;

/// What the scheduler allocated to this job. `None` means not reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterResources {
    pub nodes: Option<u32>,
    pub cpus_per_node: Option<u32>,
    /// Megabytes
    pub mem_per_node_mb: Option<u64>,
}

impl ClusterResources {
    pub fn strategy(&self) -> ExecutionStrategy {
        match self.nodes {
            Some(nodes) if nodes > 1 => ExecutionStrategy::MultiNode(nodes),
            _ => ExecutionStrategy::SingleNode,
        }
    }

    pub fn calibrator_threads(&self) -> u32 {
        calibrator_threads(self.cpus_per_node)
    }
}

/// Threads given to the calibrator: the detected CPU count, never above
/// [`MAX_CALIBRATOR_THREADS`].
pub fn calibrator_threads(cpus: Option<u32>) -> u32 {
    cpus.unwrap_or(MAX_CALIBRATOR_THREADS)
        .clamp(1, MAX_CALIBRATOR_THREADS)
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct ClusterResourceProbe {
    lookup: Lookup,
}

impl ClusterResourceProbe {
    /// Probe the process environment.
    pub fn from_env() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    pub fn probe(&self) -> ClusterResources {
        let resources = ClusterResources {
            nodes: self.read(SLURM_JOB_NUM_NODES),
            cpus_per_node: self.read(SLURM_CPUS_ON_NODE),
            mem_per_node_mb: self.read(SLURM_MEM_PER_NODE),
        };

        let mem = resources
            .mem_per_node_mb
            .map(|mb| format!("{mb} MB"))
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            nodes = ?resources.nodes,
            cpus_per_node = ?resources.cpus_per_node,
            mem_per_node = %mem,
            strategy = %resources.strategy(),
            "Detected cluster resources"
        );
        resources
    }

    pub fn detect(&self) -> ExecutionStrategy {
        self.probe().strategy()
    }

    fn read<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = (self.lookup)(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(var = key, value = %raw, "Ignoring unparsable scheduler variable");
                None
            }
        }
    }
}
