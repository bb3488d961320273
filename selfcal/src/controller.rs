//! The self-calibration state machine.
//!
//! ```text
//! Init → PrepareInput → [InitialCalibration] → (Image(i) → Calibrate(i))* → FinalImage → Done
//!                                  any state → [Cancelling] → Terminated
//! ```
//!
//! Exactly one external tool runs at a time. The execution strategy and
//! launch modifiers are fixed when the controller is built and are not
//! revisited between cycles.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use selfcal_types::{
    CycleDescriptor, CycleImageRetention, ExecutionStrategy, ProcessResult, RetentionPolicy,
    RunConfiguration, RunOutcome, RunPhase, RunSummary, StageStatus, StageTiming,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterResources;
use crate::commands::{
    gaincal_command, imaging_command, initial_gaincal_command, render_with_modifiers,
    CommandModifier, ContainerExec, Mpirun, ToolCommand,
};
use crate::config::ToolSettings;
use crate::error::{PipelineError, ToolExecutionError};
use crate::prepare::{MeasurementSetPreparer, PREPARE_STAGE};
use crate::report;
use crate::runner::{ToolInvocation, ToolLauncher};
use crate::workspace::WorkspaceManager;

pub const INITIAL_CALIBRATION_STAGE: &str = "initial_calibration";

/// Stage that owns run-level artifacts such as the summary.
pub const RUN_STAGE: &str = "run";

/// Per-band intermediates written by the multi-node imager.
const SCRATCH_FITS_PATTERNS: [&str; 2] = [
    r"^(.*?)-(\d{4})-(dirty|image|model|psf|residual)\.fits$",
    r"^(.*?)-(dirty|image|model|psf|residual)-(\d{4})-tmp\.fits$",
];

fn scratch_fits_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SCRATCH_FITS_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

/// True for files the imager leaves behind that are never deliverables.
pub fn is_imager_scratch(file_name: &str) -> bool {
    file_name.ends_with(".tmp")
        || scratch_fits_patterns()
            .iter()
            .any(|re| re.is_match(file_name))
}

/// Mutable state of one run, owned by the controller for its duration.
#[derive(Debug)]
pub struct RunState {
    phase: RunPhase,
    history: Vec<RunPhase>,
    stages: Vec<StageTiming>,
    cycle_images: Vec<PathBuf>,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: RunPhase::Init,
            history: vec![RunPhase::Init],
            stages: Vec::new(),
            cycle_images: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, next: RunPhase) {
        debug!(from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
        self.history.push(next);
    }

    fn record(
        &mut self,
        stage: &str,
        program: &str,
        started_at: DateTime<Utc>,
        started: Instant,
        status: StageStatus,
    ) {
        self.stages.push(StageTiming {
            stage: stage.to_string(),
            program: program.to_string(),
            started_at,
            duration_secs: started.elapsed().as_secs_f64(),
            status,
        });
    }
}

/// What a finished run hands back to its caller.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub error: Option<PipelineError>,
    pub summary: RunSummary,
}

pub struct SelfCalController<L: ToolLauncher> {
    config: RunConfiguration,
    tools: ToolSettings,
    resources: ClusterResources,
    strategy: ExecutionStrategy,
    modifiers: Vec<Box<dyn CommandModifier>>,
    launcher: L,
}

impl<L: ToolLauncher> SelfCalController<L> {
    /// `resources` is the one-shot probe result; the execution strategy is
    /// derived from it here and never re-evaluated.
    pub fn new(
        config: RunConfiguration,
        tools: ToolSettings,
        resources: ClusterResources,
        launcher: L,
    ) -> Self {
        let strategy = resources.strategy();
        let mut modifiers: Vec<Box<dyn CommandModifier>> = Vec::new();
        if let ExecutionStrategy::MultiNode(nodes) = strategy {
            modifiers.push(Box::new(Mpirun::new(nodes, &tools)));
        }
        Self {
            config,
            tools,
            resources,
            strategy,
            modifiers,
            launcher,
        }
    }

    /// Launch every tool inside `image`.
    pub fn with_container_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.modifiers.push(Box::new(ContainerExec::new(
            self.tools.container_runtime.clone(),
            image,
        )));
        self
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Execute the whole run. Never returns early: the workspace is
    /// finalized and the summary written on every path.
    pub async fn run(&self, workspace: &mut WorkspaceManager, cancel: &CancellationToken) -> RunReport {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut state = RunState::new();

        info!(
            run_dir = %workspace.run_dir().display(),
            strategy = %self.strategy,
            cycles = self.config.num_cycles(),
            "Starting self-calibration"
        );

        let result = match self.drive(&mut state, workspace, cancel).await {
            // A tool that died while the token was being cancelled did not fail.
            Err(e) if cancel.is_cancelled() && !matches!(e, PipelineError::Cancelled) => {
                debug!("Treating error during cancellation as cancelled: {e}");
                Err(PipelineError::Cancelled)
            }
            result => result,
        };
        let interrupted_in = state.phase();
        let outcome = match &result {
            Ok(()) => RunOutcome::Succeeded,
            Err(PipelineError::Cancelled) => RunOutcome::Cancelled,
            Err(_) => RunOutcome::Failed,
        };

        match outcome {
            RunOutcome::Succeeded => {}
            RunOutcome::Failed => state.transition(RunPhase::Terminated),
            RunOutcome::Cancelled => {
                state.transition(RunPhase::Cancelling);
                state.transition(RunPhase::Terminated);
            }
        }

        if outcome != RunOutcome::Succeeded
            && self.config.cycle_image_retention == CycleImageRetention::OnFailure
        {
            for image in &state.cycle_images {
                workspace.retain(image);
            }
        }

        let error = result.err();
        let summary = RunSummary {
            run_dir: workspace.run_dir().to_path_buf(),
            outcome,
            error: error.as_ref().map(ToString::to_string),
            strategy: self.strategy,
            phases: state.history.clone(),
            stages: state.stages.clone(),
            started_at,
            finished_at: Utc::now(),
        };

        let summary_path = workspace.path(report::SUMMARY_FILE_NAME);
        workspace.register(&summary_path, RUN_STAGE, RetentionPolicy::KeepAlways);
        if let Err(e) = report::write_summary(&summary_path, &summary) {
            warn!("Failed to write run summary: {e}");
        }

        workspace.finalize(outcome == RunOutcome::Succeeded);

        match (&outcome, &error) {
            (RunOutcome::Succeeded, _) => info!("Pipeline run: SUCCESS"),
            (RunOutcome::Cancelled, _) => warn!(phase = %interrupted_in, "Pipeline run: CANCELLED"),
            (RunOutcome::Failed, err) => error!(
                error = %err.as_ref().map(ToString::to_string).unwrap_or_default(),
                "Pipeline run: FAIL"
            ),
        }
        info!("selfcal finished in {:.2} seconds", started.elapsed().as_secs_f64());

        RunReport {
            outcome,
            error,
            summary,
        }
    }

    async fn drive(
        &self,
        state: &mut RunState,
        workspace: &mut WorkspaceManager,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        state.transition(RunPhase::PrepareInput);
        let dataset = self.prepare_input(state, workspace, cancel).await?;

        if let Some(sky_model) = &self.config.initial_sky_model {
            state.transition(RunPhase::InitialCalibration);
            info!(
                sky_model = %sky_model.display(),
                "Running initial gain calibration using sky model"
            );
            workspace.begin_stage(INITIAL_CALIBRATION_STAGE);
            let command = initial_gaincal_command(
                &self.tools,
                &dataset,
                sky_model,
                &self.config.calibration,
                self.resources.calibrator_threads(),
            );
            let result = self
                .run_tool(state, workspace, cancel, INITIAL_CALIBRATION_STAGE, command, None)
                .await;
            workspace.exit_stage(INITIAL_CALIBRATION_STAGE);
            result?;
        }

        for cycle in self.config.cycles() {
            info!(
                phase_only = cycle.is_phase_only,
                niter = cycle.clean_iterations,
                "Starting Major Cycle {}",
                cycle
            );

            state.transition(RunPhase::Image(cycle.index));
            self.image(state, workspace, cancel, &dataset, cycle).await?;

            state.transition(RunPhase::Calibrate(cycle.index));
            self.calibrate(state, workspace, cancel, &dataset, cycle).await?;
        }

        info!("Making final image");
        state.transition(RunPhase::FinalImage);
        self.image(state, workspace, cancel, &dataset, self.config.final_cycle())
            .await?;

        state.transition(RunPhase::Done);
        Ok(())
    }

    async fn prepare_input(
        &self,
        state: &mut RunState,
        workspace: &mut WorkspaceManager,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let program = if self.config.inputs.len() > 1 {
            self.tools.calibrator.as_str()
        } else {
            "copy"
        };

        workspace.begin_stage(PREPARE_STAGE);
        let started_at = Utc::now();
        let started = Instant::now();
        let preparer = MeasurementSetPreparer::new(&self.launcher, &self.tools, &self.modifiers);
        let result = preparer.prepare(&self.config.inputs, workspace, cancel).await;
        state.record(PREPARE_STAGE, program, started_at, started, stage_status(&result, cancel));
        workspace.exit_stage(PREPARE_STAGE);
        result
    }

    async fn image(
        &self,
        state: &mut RunState,
        workspace: &mut WorkspaceManager,
        cancel: &CancellationToken,
        dataset: &Path,
        cycle: CycleDescriptor,
    ) -> Result<(), PipelineError> {
        let stage = format!("{}.image", cycle.image_name());
        workspace.begin_stage(&stage);

        let name = workspace.path(cycle.image_name());
        let command = imaging_command(
            &self.tools,
            dataset,
            workspace.run_dir(),
            &name,
            cycle.clean_iterations,
            &self.config.imaging,
        );
        let result = self
            .run_tool(state, workspace, cancel, &stage, command, Some(cycle))
            .await;

        // Whatever the outcome, sort what the imager left behind.
        self.register_imaging_outputs(state, workspace, &stage, &cycle);
        workspace.exit_stage(&stage);
        result.map(|_| ())
    }

    async fn calibrate(
        &self,
        state: &mut RunState,
        workspace: &mut WorkspaceManager,
        cancel: &CancellationToken,
        dataset: &Path,
        cycle: CycleDescriptor,
    ) -> Result<(), PipelineError> {
        let stage = format!("{}.calibrate", cycle.image_name());
        workspace.begin_stage(&stage);

        let command = gaincal_command(
            &self.tools,
            dataset,
            cycle.caltype(),
            &self.config.calibration,
            self.resources.calibrator_threads(),
        );
        let result = self
            .run_tool(state, workspace, cancel, &stage, command, Some(cycle))
            .await;
        workspace.exit_stage(&stage);
        result.map(|_| ())
    }

    async fn run_tool(
        &self,
        state: &mut RunState,
        workspace: &WorkspaceManager,
        cancel: &CancellationToken,
        stage: &str,
        command: ToolCommand,
        cycle: Option<CycleDescriptor>,
    ) -> Result<ProcessResult, PipelineError> {
        if cancel.is_cancelled() {
            info!(stage, "Cancellation observed, not starting stage");
            return Err(PipelineError::Cancelled);
        }

        let rendered = render_with_modifiers(command, &self.modifiers);
        let mut invocation = ToolInvocation::new(stage, rendered, workspace.run_dir());
        if let Some(cycle) = cycle {
            invocation = invocation.with_cycle(cycle);
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let result = self.launcher.launch(&invocation, cancel).await;
        state.record(stage, &invocation.tool, started_at, started, stage_status(&result, cancel));
        result.map_err(PipelineError::from)
    }

    fn register_imaging_outputs(
        &self,
        state: &mut RunState,
        workspace: &mut WorkspaceManager,
        stage: &str,
        cycle: &CycleDescriptor,
    ) {
        let entries = match fs::read_dir(workspace.run_dir()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(stage, "Failed to scan run directory: {e}");
                return;
            }
        };

        let image_prefix = format!("{}-", cycle.image_name());
        let image_retention = if cycle.is_final {
            RetentionPolicy::KeepAlways
        } else {
            match self.config.cycle_image_retention {
                CycleImageRetention::Always => RetentionPolicy::KeepAlways,
                CycleImageRetention::OnFailure | CycleImageRetention::Never => {
                    RetentionPolicy::DeleteOnRunExit
                }
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            // Anything already claimed (working dataset, log, older
            // cycle images) keeps its policy.
            if workspace.artifact(&path).is_some() {
                continue;
            }
            if is_imager_scratch(&file_name) {
                workspace.register(path, stage, RetentionPolicy::DeleteOnStageExit);
            } else if file_name.starts_with(&image_prefix) && file_name.ends_with(".fits") {
                if !cycle.is_final {
                    state.cycle_images.push(path.clone());
                }
                workspace.register(path, stage, image_retention);
            }
        }
    }
}

fn stage_status<T>(result: &Result<T, impl StageError>, cancel: &CancellationToken) -> StageStatus {
    match result {
        Ok(_) => StageStatus::Completed,
        Err(e) if e.is_cancellation() || cancel.is_cancelled() => StageStatus::Cancelled,
        Err(_) => StageStatus::Failed,
    }
}

trait StageError {
    fn is_cancellation(&self) -> bool;
}

impl StageError for ToolExecutionError {
    fn is_cancellation(&self) -> bool {
        self.is_cancelled()
    }
}

impl StageError for PipelineError {
    fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
