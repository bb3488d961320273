//! Input preparation: turn the user's sub-band measurement sets into the
//! single working dataset that self-calibration mutates in place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use selfcal_types::RetentionPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::commands::{merge_command, render_with_modifiers, CommandModifier};
use crate::config::ToolSettings;
use crate::error::{InputError, PipelineError, ToolExecutionError};
use crate::runner::{ToolInvocation, ToolLauncher};
use crate::workspace::WorkspaceManager;

/// Name of the working dataset inside the run directory.
pub const WORKING_DATASET: &str = "working.ms";

/// Stage label used for artifacts and logs.
pub const PREPARE_STAGE: &str = "prepare_input";

pub struct MeasurementSetPreparer<'a, L: ToolLauncher> {
    launcher: &'a L,
    tools: &'a ToolSettings,
    modifiers: &'a [Box<dyn CommandModifier>],
}

impl<'a, L: ToolLauncher> MeasurementSetPreparer<'a, L> {
    pub fn new(
        launcher: &'a L,
        tools: &'a ToolSettings,
        modifiers: &'a [Box<dyn CommandModifier>],
    ) -> Self {
        Self {
            launcher,
            tools,
            modifiers,
        }
    }

    /// Produce the working dataset inside `workspace` and return its path.
    ///
    /// The inputs are only ever read.
    pub async fn prepare(
        &self,
        inputs: &[PathBuf],
        workspace: &mut WorkspaceManager,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        if inputs.is_empty() {
            return Err(InputError::Empty.into());
        }
        if let Some(missing) = inputs.iter().find(|p| !p.exists()) {
            return Err(InputError::Missing(missing.clone()).into());
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let target = workspace.path(WORKING_DATASET);
        // Registered before creation so a partial copy is cleaned up too.
        workspace.register(&target, PREPARE_STAGE, RetentionPolicy::DeleteOnRunExit);

        match inputs {
            [single] => {
                info!(input = %single.display(), target = %target.display(), "Copying input measurement set");
                let from = single.clone();
                let to = target.clone();
                tokio::task::spawn_blocking(move || copy_recursive(&from, &to))
                    .await
                    .map_err(|e| InputError::Copy {
                        from: single.clone(),
                        source: io::Error::new(io::ErrorKind::Other, e),
                    })?
                    .map_err(|source| InputError::Copy {
                        from: single.clone(),
                        source,
                    })?;
            }
            many => {
                info!(inputs = many.len(), target = %target.display(), "Merging input measurement sets");
                let command = render_with_modifiers(merge_command(self.tools, many, &target), self.modifiers);
                let invocation = ToolInvocation::new(PREPARE_STAGE, command, workspace.run_dir());
                self.launcher
                    .launch(&invocation, cancel)
                    .await
                    .map_err(merge_error)?;
            }
        }

        match dataset_size(&target) {
            Ok(bytes) => info!(bytes, "Input size in bytes: {bytes}"),
            Err(e) => warn!(target = %target.display(), "Failed to measure working dataset: {e}"),
        }
        Ok(target)
    }
}

fn merge_error(err: ToolExecutionError) -> PipelineError {
    if err.is_cancelled() {
        PipelineError::Cancelled
    } else {
        InputError::MergeRejected(err).into()
    }
}

/// Copy a file or a directory tree.
fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_file() {
        fs::copy(from, to)?;
        return Ok(());
    }

    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Total size in bytes of every file under `path`.
pub fn dataset_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(total)
}
