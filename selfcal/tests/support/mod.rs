//! Shared fixtures for the selfcal integration tests.
//!
//! `RecordingLauncher` stands in for the imager and calibrator: it records
//! every invocation, writes the files a real imager would leave behind, and
//! can be told to fail or cancel at a given stage.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use selfcal::{ToolExecutionError, ToolInvocation, ToolLauncher};
use selfcal_types::ProcessResult;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
pub struct RecordingLauncher {
    calls: Arc<Mutex<Vec<ToolInvocation>>>,
    fail_stage: Option<(String, i32)>,
    cancel_stage: Option<String>,
    interrupt_stage: Option<String>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` when `stage` runs.
    pub fn failing_at(mut self, stage: &str, code: i32) -> Self {
        self.fail_stage = Some((stage.to_string(), code));
        self
    }

    /// Behave like an operator interrupt arriving while `stage` runs.
    pub fn cancelling_at(mut self, stage: &str) -> Self {
        self.cancel_stage = Some(stage.to_string());
        self
    }

    /// Die from a signal while `stage` runs, with the run being cancelled
    /// at the same moment, as a terminal Ctrl-C does.
    pub fn interrupted_at(mut self, stage: &str) -> Self {
        self.interrupt_stage = Some(stage.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.stage).collect()
    }

    pub fn imaging_calls(&self) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.stage.ends_with(".image"))
            .collect()
    }

    pub fn calibration_calls(&self) -> Vec<ToolInvocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.stage.ends_with(".calibrate"))
            .collect()
    }
}

#[async_trait]
impl ToolLauncher for RecordingLauncher {
    async fn launch(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult, ToolExecutionError> {
        self.calls.lock().unwrap().push(invocation.clone());

        // Outputs are written even when the tool then fails.
        if let Some(name) = option_value(&invocation.argv, "-name") {
            write_imager_outputs(Path::new(&name));
        }
        if let Some(out) = key_value(&invocation.argv, "msout") {
            if key_value(&invocation.argv, "steps").as_deref() == Some("[]") {
                let out = PathBuf::from(out);
                fs::create_dir_all(&out).unwrap();
                fs::write(out.join("table.dat"), b"merged").unwrap();
            }
        }

        if self.cancel_stage.as_deref() == Some(invocation.stage.as_str()) {
            cancel.cancel();
            return Err(ToolExecutionError::Cancelled {
                program: invocation.tool.clone(),
                duration: Duration::from_millis(5),
            });
        }

        if self.interrupt_stage.as_deref() == Some(invocation.stage.as_str()) {
            cancel.cancel();
            return Err(ToolExecutionError::NonZeroExit {
                program: invocation.tool.clone(),
                exit_code: None,
                duration: Duration::from_millis(5),
            });
        }

        if let Some((stage, code)) = &self.fail_stage {
            if *stage == invocation.stage {
                return Err(ToolExecutionError::NonZeroExit {
                    program: invocation.tool.clone(),
                    exit_code: Some(*code),
                    duration: Duration::from_millis(5),
                });
            }
        }

        Ok(ProcessResult {
            exit_code: 0,
            wall_clock_duration: Duration::from_millis(5),
            stdout_lines: vec![format!("{} done", invocation.tool)],
            stderr_lines: Vec::new(),
        })
    }
}

/// Value following `key` in an imager-style argument vector.
pub fn option_value(argv: &[String], key: &str) -> Option<String> {
    argv.iter()
        .position(|a| a == key)
        .and_then(|i| argv.get(i + 1))
        .cloned()
}

/// Value of `key=value` in a calibrator-style argument vector.
pub fn key_value(argv: &[String], key: &str) -> Option<String> {
    let prefix = format!("{key}=");
    argv.iter()
        .find_map(|a| a.strip_prefix(&prefix).map(ToString::to_string))
}

/// The image products, one per-band intermediate and a temp file.
fn write_imager_outputs(name: &Path) {
    let dir = name.parent().unwrap();
    let base = name.file_name().unwrap().to_string_lossy().to_string();
    for suffix in ["image", "model", "residual"] {
        fs::write(dir.join(format!("{base}-{suffix}.fits")), b"FITS").unwrap();
    }
    fs::write(dir.join(format!("{base}-0000-image.fits")), b"FITS").unwrap();
    fs::write(dir.join(format!("{base}-psf-0000-tmp.fits")), b"FITS").unwrap();
    fs::write(dir.join("wsclean-scratch.tmp"), b"tmp").unwrap();
}

/// A fake measurement set: a directory with a couple of table files.
pub fn fake_measurement_set(parent: &Path, name: &str, payload: &[u8]) -> PathBuf {
    let ms = parent.join(name);
    fs::create_dir_all(ms.join("ANTENNA")).unwrap();
    fs::write(ms.join("table.dat"), payload).unwrap();
    fs::write(ms.join("ANTENNA").join("table.f0"), b"antennas").unwrap();
    ms
}

/// Every file under `dir`, relative paths with contents, sorted.
pub fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            (
                e.path().strip_prefix(dir).unwrap().to_path_buf(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}

/// Write an `sh` script into `dir` and return its path.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// In-memory log sink. Install with [`CapturedLogs::install`] at the top of
/// a `#[tokio::test]`; the current-thread runtime keeps spawned tasks on the
/// same thread, so their events land here too.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buf.lock().unwrap())
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    /// The single captured line containing `needle`.
    pub fn line_with(&self, needle: &str) -> String {
        let matching: Vec<String> = self
            .lines()
            .into_iter()
            .filter(|l| l.contains(needle))
            .collect();
        assert_eq!(matching.len(), 1, "expected one line with {needle:?}, got {matching:?}");
        matching[0].clone()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
