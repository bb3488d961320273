//! Run-scoped output directory and artifact registry.
//!
//! Every file or directory the pipeline synthesizes inside the run directory
//! is registered here together with a [`RetentionPolicy`]. Stage scratch is
//! deleted when its stage exits; run temporaries are deleted by
//! [`WorkspaceManager::finalize`], which runs exactly once per run: either
//! explicitly or, failing that, from `Drop`.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use selfcal_types::{Artifact, RetentionPolicy};
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;

/// Prefix of every run directory name.
pub const RUN_DIR_PREFIX: &str = "selfcal";

const WRITE_PROBE: &str = ".selfcal_write_probe";

/// Counts reported by [`WorkspaceManager::finalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
    pub kept: usize,
}

pub struct WorkspaceManager {
    run_dir: PathBuf,
    artifacts: Vec<Artifact>,
    open_stages: HashSet<String>,
    exited_stages: HashSet<String>,
    finalized: bool,
}

impl WorkspaceManager {
    /// Create a fresh, uniquely named run directory under `base`.
    ///
    /// The name is derived from the current local time down to the
    /// microsecond, e.g. `selfcal_20230702_145127_123456`.
    pub fn create_run_directory(base: &Path) -> Result<Self, WorkspaceError> {
        let base = absolute(base).map_err(|source| WorkspaceError::Create {
            path: base.to_path_buf(),
            source,
        })?;
        fs::create_dir_all(&base).map_err(|source| WorkspaceError::Create {
            path: base.clone(),
            source,
        })?;

        loop {
            let name = Local::now()
                .format(&format!("{RUN_DIR_PREFIX}_%Y%m%d_%H%M%S_%6f"))
                .to_string();
            let run_dir = base.join(name);
            match fs::create_dir(&run_dir) {
                Ok(()) => return Self::open(run_dir),
                // Another run started within the same microsecond.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(source) => {
                    return Err(WorkspaceError::Create {
                        path: run_dir,
                        source,
                    })
                }
            }
        }
    }

    /// Use `run_dir` as the run directory, creating it and its parents when
    /// missing. An existing directory is accepted only if it is empty.
    pub fn open(run_dir: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let run_dir = run_dir.into();

        fs::create_dir_all(&run_dir).map_err(|source| WorkspaceError::Create {
            path: run_dir.clone(),
            source,
        })?;

        let mut entries = fs::read_dir(&run_dir).map_err(|source| WorkspaceError::Create {
            path: run_dir.clone(),
            source,
        })?;
        if entries.next().is_some() {
            return Err(WorkspaceError::NotEmpty(run_dir));
        }

        let probe = run_dir.join(WRITE_PROBE);
        fs::write(&probe, b"")
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|source| WorkspaceError::NotWritable {
                path: run_dir.clone(),
                source,
            })?;

        info!(run_dir = %run_dir.display(), "Created run directory");
        Ok(Self {
            run_dir,
            artifacts: Vec::new(),
            open_stages: HashSet::new(),
            exited_stages: HashSet::new(),
            finalized: false,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Path of `name` inside the run directory.
    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.run_dir.join(name)
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn artifact(&self, path: &Path) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.path == path)
    }

    /// Record an artifact for later disposal. Registering the same path
    /// again with the same policy is a no-op; a different policy replaces the
    /// previous one.
    pub fn register(
        &mut self,
        path: impl Into<PathBuf>,
        producing_stage: &str,
        retention: RetentionPolicy,
    ) {
        let path = path.into();
        if let Some(existing) = self.artifacts.iter_mut().find(|a| a.path == path) {
            if existing.retention != retention {
                debug!(
                    path = %path.display(),
                    from = ?existing.retention,
                    to = ?retention,
                    "Artifact retention changed"
                );
                existing.retention = retention;
            }
            return;
        }

        debug!(path = %path.display(), stage = producing_stage, ?retention, "Registered artifact");
        self.artifacts.push(Artifact {
            path,
            producing_stage: producing_stage.to_string(),
            retention,
        });
    }

    /// Promote an already registered artifact so that it survives the run.
    pub fn retain(&mut self, path: &Path) -> bool {
        match self.artifacts.iter_mut().find(|a| a.path == path) {
            Some(artifact) => {
                artifact.retention = RetentionPolicy::KeepAlways;
                true
            }
            None => false,
        }
    }

    pub fn begin_stage(&mut self, stage: &str) {
        self.open_stages.insert(stage.to_string());
    }

    pub fn stage_exited(&self, stage: &str) -> bool {
        self.exited_stages.contains(stage)
    }

    /// Mark `stage` as exited, whatever its outcome, and delete the
    /// `DeleteOnStageExit` artifacts it produced.
    pub fn exit_stage(&mut self, stage: &str) -> CleanupReport {
        self.open_stages.remove(stage);
        self.exited_stages.insert(stage.to_string());
        self.dispose(|artifact, _| {
            artifact.retention == RetentionPolicy::DeleteOnStageExit
                && artifact.producing_stage == stage
        })
    }

    /// Dispose of every temporary artifact. `success` is only reported: the
    /// same artifacts are deleted whatever the outcome of the run.
    pub fn finalize(&mut self, success: bool) -> CleanupReport {
        if self.finalized {
            warn!(run_dir = %self.run_dir.display(), "Workspace already finalized");
            return CleanupReport::default();
        }
        self.finalized = true;

        info!(
            run_dir = %self.run_dir.display(),
            success,
            "Running cleanup in run directory"
        );

        // Run exit is also the exit of any stage that never closed.
        let still_open: Vec<String> = self.open_stages.drain().collect();
        self.exited_stages.extend(still_open);

        let mut report = self.dispose(|artifact, exited| match artifact.retention {
            RetentionPolicy::KeepAlways => false,
            RetentionPolicy::DeleteOnRunExit => true,
            RetentionPolicy::DeleteOnStageExit => exited.contains(&artifact.producing_stage),
        });
        report.kept = self
            .artifacts
            .iter()
            .filter(|a| a.retention == RetentionPolicy::KeepAlways)
            .count();

        info!(
            deleted = report.deleted,
            failed = report.failed,
            kept = report.kept,
            "Cleanup finished"
        );
        report
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    fn dispose<F>(&mut self, mut selected: F) -> CleanupReport
    where
        F: FnMut(&Artifact, &HashSet<String>) -> bool,
    {
        let mut report = CleanupReport::default();
        let exited = &self.exited_stages;
        self.artifacts.retain(|artifact| {
            if !selected(artifact, exited) {
                return true;
            }
            match remove_path(&artifact.path) {
                Ok(true) => {
                    debug!(path = %artifact.path.display(), "Deleted artifact");
                    report.deleted += 1;
                    false
                }
                Ok(false) => false,
                Err(e) => {
                    warn!(
                        path = %artifact.path.display(),
                        error = %e,
                        "Failed to delete artifact"
                    );
                    report.failed += 1;
                    false
                }
            }
        });
        report
    }
}

impl Drop for WorkspaceManager {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                run_dir = %self.run_dir.display(),
                "Workspace dropped before finalize; cleaning up as a failed run"
            );
            self.finalize(false);
        }
    }
}

/// Delete a file or a directory tree. Returns `Ok(false)` if nothing was
/// there.
fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
