//! Shared types for the selfcal pipeline
//!
//! These types are used by:
//! - the pipeline control core (`selfcal` library)
//! - the `selfcal` binary when it builds a run from the command line
//! - the run summary written into every run directory
//!
//! Serializable with serde so a finished run can be inspected as JSON.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Clean iterations used by the final imaging step unless overridden.
/// Large enough to deconvolve down to the noise floor.
pub const DEFAULT_FINAL_CLEAN_ITERATIONS: u64 = 100_000;

// ============================================================================
// Run Configuration
// ============================================================================

/// Imager tunables shared by every imaging invocation of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingParameters {
    /// Image size in pixels (width, height)
    pub size: (u32, u32),
    /// Pixel scale, e.g. "1asec" or "0.01deg"
    pub scale: String,
    /// Weighting mode: "natural", "uniform" or "briggs <robustness>"
    pub weight: String,
}

impl Default for ImagingParameters {
    fn default() -> Self {
        Self {
            size: (4096, 4096),
            scale: "1asec".to_string(),
            weight: "uniform".to_string(),
        }
    }
}

/// Calibrator tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    /// Time slots over which a gain solution is constant. 0 means all.
    pub solint: u32,
    /// Channels over which a gain solution is constant. 0 means all.
    pub nchan: u32,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self { solint: 1, nchan: 0 }
    }
}

/// What happens to the images produced by the major cycles (not the final
/// image, which is always kept).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleImageRetention {
    /// Keep every cycle image.
    #[default]
    Always,
    /// Keep cycle images only when the run does not succeed.
    OnFailure,
    /// Delete cycle images at run exit.
    Never,
}

impl FromStr for CycleImageRetention {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "on-failure" | "on_failure" => Ok(Self::OnFailure),
            "never" => Ok(Self::Never),
            other => Err(ConfigError::InvalidValue {
                field: "cycle_image_retention",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable description of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Input measurement sets, one per sub-band
    pub inputs: Vec<PathBuf>,
    /// Directory under which the run directory is created
    pub output_base: PathBuf,
    /// Maximum clean iterations per major cycle; its length is the cycle count
    pub clean_iterations: Vec<u64>,
    /// Zero-based cycle indices that calibrate phase only
    pub phase_only_cycles: BTreeSet<usize>,
    /// Optional sky model for a calibration before the first cycle
    pub initial_sky_model: Option<PathBuf>,
    pub imaging: ImagingParameters,
    pub calibration: CalibrationParameters,
    /// Clean iterations of the final imaging step
    pub final_clean_iterations: u64,
    #[serde(default)]
    pub cycle_image_retention: CycleImageRetention,
}

impl RunConfiguration {
    pub fn new(inputs: Vec<PathBuf>, output_base: impl Into<PathBuf>) -> Self {
        Self {
            inputs,
            output_base: output_base.into(),
            clean_iterations: vec![20, 100, 500],
            phase_only_cycles: BTreeSet::from([0]),
            initial_sky_model: None,
            imaging: ImagingParameters::default(),
            calibration: CalibrationParameters::default(),
            final_clean_iterations: DEFAULT_FINAL_CLEAN_ITERATIONS,
            cycle_image_retention: CycleImageRetention::default(),
        }
    }

    /// Check the invariants the control core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inputs.is_empty() {
            return Err(ConfigError::NoInputs);
        }

        let cycles = self.num_cycles();
        if let Some(&index) = self.phase_only_cycles.iter().find(|&&i| i >= cycles) {
            return Err(ConfigError::PhaseOnlyCycleOutOfRange { index, cycles });
        }

        let (width, height) = self.imaging.size;
        if width == 0 || height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "size",
                value: format!("{width}x{height}"),
            });
        }
        if self.imaging.scale.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "scale",
                value: self.imaging.scale.clone(),
            });
        }

        let deepest = self.clean_iterations.iter().copied().max().unwrap_or(0);
        if self.final_clean_iterations <= deepest {
            return Err(ConfigError::FinalIterationsTooLow {
                final_iterations: self.final_clean_iterations,
                deepest_cycle: deepest,
            });
        }

        Ok(())
    }

    /// Number of major cycles, not counting the final imaging step.
    pub fn num_cycles(&self) -> usize {
        self.clean_iterations.len()
    }

    pub fn is_phase_only(&self, index: usize) -> bool {
        self.phase_only_cycles.contains(&index)
    }

    /// Descriptors of the major cycles, in execution order.
    pub fn cycles(&self) -> impl Iterator<Item = CycleDescriptor> + '_ {
        let total = self.num_cycles();
        self.clean_iterations
            .iter()
            .enumerate()
            .map(move |(index, &clean_iterations)| CycleDescriptor {
                index,
                total_cycles: total,
                clean_iterations,
                is_phase_only: self.is_phase_only(index),
                is_final: false,
            })
    }

    /// Descriptor of the final imaging step.
    pub fn final_cycle(&self) -> CycleDescriptor {
        let total = self.num_cycles();
        CycleDescriptor {
            index: total,
            total_cycles: total,
            clean_iterations: self.final_clean_iterations,
            is_phase_only: false,
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one input measurement set is required")]
    NoInputs,

    #[error("Phase-only cycle index {index} is out of range for {cycles} major cycle(s)")]
    PhaseOnlyCycleOutOfRange { index: usize, cycles: usize },

    #[error("Final clean iterations ({final_iterations}) must exceed every cycle value (max {deepest_cycle})")]
    FinalIterationsTooLow {
        final_iterations: u64,
        deepest_cycle: u64,
    },

    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

// ============================================================================
// Cycles and Strategy
// ============================================================================

/// One imaging (and possibly calibration) step of the self-calibration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleDescriptor {
    pub index: usize,
    /// Number of major cycles; the final step is not counted
    pub total_cycles: usize,
    pub clean_iterations: u64,
    pub is_phase_only: bool,
    pub is_final: bool,
}

impl CycleDescriptor {
    /// Base name of the images written for this cycle.
    pub fn image_name(&self) -> String {
        if self.is_final {
            "final".to_string()
        } else {
            format!("cycle{:02}", self.index + 1)
        }
    }

    /// Gain solution type for the calibration that follows this cycle.
    pub fn caltype(&self) -> &'static str {
        if self.is_phase_only {
            "diagonalphase"
        } else {
            "diagonal"
        }
    }
}

impl fmt::Display for CycleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_final {
            write!(f, "final")
        } else {
            write!(f, "{}/{}", self.index + 1, self.total_cycles)
        }
    }
}

/// How the imager is launched. Decided once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "nodes", rename_all = "snake_case")]
pub enum ExecutionStrategy {
    SingleNode,
    MultiNode(u32),
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStrategy::SingleNode => write!(f, "single-node"),
            ExecutionStrategy::MultiNode(nodes) => write!(f, "multi-node ({nodes} nodes)"),
        }
    }
}

// ============================================================================
// Artifacts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Deliverables: final images, logs, the run summary
    KeepAlways,
    /// Scratch files deleted as soon as the producing stage exits
    DeleteOnStageExit,
    /// Temporaries deleted when the run exits, whatever the outcome
    DeleteOnRunExit,
}

/// A file or directory created inside the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// Label of the stage that created it
    pub producing_stage: String,
    pub retention: RetentionPolicy,
}

// ============================================================================
// Process Results
// ============================================================================

/// Outcome of one external tool invocation that exited with code 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub wall_clock_duration: Duration,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

// ============================================================================
// Run Lifecycle
// ============================================================================

/// States of the self-calibration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "cycle", rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    PrepareInput,
    InitialCalibration,
    Image(usize),
    Calibrate(usize),
    FinalImage,
    Done,
    Cancelling,
    Terminated,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Init => write!(f, "init"),
            RunPhase::PrepareInput => write!(f, "prepare_input"),
            RunPhase::InitialCalibration => write!(f, "initial_calibration"),
            RunPhase::Image(cycle) => write!(f, "image[{cycle}]"),
            RunPhase::Calibrate(cycle) => write!(f, "calibrate[{cycle}]"),
            RunPhase::FinalImage => write!(f, "final_image"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Cancelling => write!(f, "cancelling"),
            RunPhase::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunOutcome {
    /// Process exit code reported by the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Succeeded => 0,
            RunOutcome::Failed => 1,
            RunOutcome::Cancelled => 130,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Wall-clock record of one external tool stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: String,
    pub program: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub status: StageStatus,
}

/// Written as `run_summary.json` at the end of every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub strategy: ExecutionStrategy,
    pub phases: Vec<RunPhase>,
    pub stages: Vec<StageTiming>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
