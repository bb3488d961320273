//! External tool execution.
//!
//! One invocation runs one child process. Its stdout and stderr are drained
//! by two independent tasks, each logging lines as they arrive. The wait for
//! the child is raced against the run's cancellation token: on cancellation
//! the child gets SIGTERM, then a bounded grace period, then SIGKILL.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use selfcal_types::{CycleDescriptor, ProcessResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::RenderedCommand;
use crate::error::ToolExecutionError;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long to wait for the output readers once the child is gone. A
/// grandchild may still hold the pipes open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tracing target of captured tool output.
pub const TOOL_OUTPUT_TARGET: &str = "selfcal::tool";

/// One launch of an external tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Stage label, e.g. `cycle02.image`
    pub stage: String,
    /// The wrapped tool (`wsclean`, `DP3`...), even when launched via a prefix
    pub tool: String,
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
    pub cycle: Option<CycleDescriptor>,
}

impl ToolInvocation {
    pub fn new(stage: impl Into<String>, command: RenderedCommand, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            tool: command.tool,
            argv: command.argv,
            working_dir: working_dir.into(),
            cycle: None,
        }
    }

    pub fn with_cycle(mut self, cycle: CycleDescriptor) -> Self {
        self.cycle = Some(cycle);
        self
    }

    /// Program actually spawned.
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or(&self.tool)
    }

    fn cycle_label(&self) -> String {
        self.cycle
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Seam between the controller and process execution.
#[async_trait]
pub trait ToolLauncher: Send + Sync {
    /// Run `invocation` to completion. A cancelled run returns
    /// [`ToolExecutionError::Cancelled`].
    async fn launch(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult, ToolExecutionError>;
}

#[derive(Debug, Clone)]
pub struct ExternalToolRunner {
    grace_period: Duration,
}

impl Default for ExternalToolRunner {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ExternalToolRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult, ToolExecutionError> {
        let program = invocation.program().to_string();
        let tool = invocation.tool.clone();
        let stage = invocation.stage.clone();
        let cycle = invocation.cycle_label();

        info!(
            stage = %stage,
            cycle = %cycle,
            command = %invocation.argv.join(" "),
            "Running command"
        );

        let started = Instant::now();
        let mut command = Command::new(&program);
        command
            .args(invocation.argv.iter().skip(1))
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C reaches only the orchestrator,
        // which then shuts the tool down through the token.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| {
                error!(stage = %stage, %program, "Failed to spawn tool: {source}");
                ToolExecutionError::Spawn {
                    program: tool.clone(),
                    source,
                }
            })?;

        let stdout_reader = child
            .stdout
            .take()
            .map(|out| OutputReader::spawn(out, "stdout", stage.clone(), cycle.clone()));
        let stderr_reader = child
            .stderr
            .take()
            .map(|err| OutputReader::spawn(err, "stderr", stage.clone(), cycle.clone()));

        let status = tokio::select! {
            biased;
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let cancelled = status.is_none();
        if cancelled {
            self.terminate(&mut child, &stage, &program).await;
        }

        let stdout_lines = OutputReader::finish(stdout_reader).await;
        let stderr_lines = OutputReader::finish(stderr_reader).await;
        let duration = started.elapsed();
        info!(
            stage = %stage,
            cycle = %cycle,
            "{tool} finished in {:.2} seconds",
            duration.as_secs_f64()
        );

        let status = match status {
            None => {
                warn!(stage = %stage, %tool, "Tool cancelled");
                return Err(ToolExecutionError::Cancelled {
                    program: tool,
                    duration,
                });
            }
            Some(Err(source)) => {
                error!(stage = %stage, %tool, "Failed while waiting for tool: {source}");
                return Err(ToolExecutionError::Wait {
                    program: tool,
                    source,
                });
            }
            Some(Ok(status)) => status,
        };

        if !status.success() && cancel.is_cancelled() {
            // Exited on its own while the run was being cancelled.
            warn!(stage = %stage, %tool, exit_code = ?status.code(), "Tool exited during cancellation");
            return Err(ToolExecutionError::Cancelled {
                program: tool,
                duration,
            });
        }

        if !status.success() {
            error!(
                stage = %stage,
                %tool,
                exit_code = ?status.code(),
                stderr_tail = %stderr_lines.iter().rev().take(5).rev().cloned().collect::<Vec<_>>().join(" | "),
                "Tool failed"
            );
            return Err(ToolExecutionError::NonZeroExit {
                program: tool,
                exit_code: status.code(),
                duration,
            });
        }

        Ok(ProcessResult {
            exit_code: status.code().unwrap_or(0),
            wall_clock_duration: duration,
            stdout_lines,
            stderr_lines,
        })
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child, stage: &str, program: &str) {
        warn!(stage, program, "Cancellation requested, sending SIGTERM");
        if !send_sigterm(child) {
            if let Err(e) = child.kill().await {
                warn!(stage, program, "Failed to kill tool: {e}");
            }
            return;
        }

        match timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(stage, program, exit_code = ?status.code(), "Tool exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(stage, program, "Failed while waiting for terminated tool: {e}");
            }
            Err(_) => {
                warn!(
                    stage,
                    program,
                    grace_secs = self.grace_period.as_secs_f64(),
                    "Tool ignored SIGTERM, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(stage, program, "Failed to kill tool: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl ToolLauncher for ExternalToolRunner {
    async fn launch(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult, ToolExecutionError> {
        self.run(invocation, cancel).await
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped
        return true;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!(pid, "Failed to send SIGTERM: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// One output channel of a running tool. Lines are logged as they arrive
/// and kept in a shared buffer, so a reader that has to be detached still
/// hands back what it already read.
struct OutputReader {
    channel: &'static str,
    lines: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl OutputReader {
    fn spawn<R>(reader: R, channel: &'static str, stage: String, cycle: String) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(drain_lines(reader, channel, stage, cycle, Arc::clone(&lines)));
        Self {
            channel,
            lines,
            task,
        }
    }

    async fn finish(reader: Option<Self>) -> Vec<String> {
        let Some(mut reader) = reader else {
            return Vec::new();
        };
        match timeout(DRAIN_TIMEOUT, &mut reader.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(channel = reader.channel, "Output reader task failed: {e}"),
            Err(_) => {
                debug!(channel = reader.channel, "Output still open after exit, detaching reader");
                reader.task.abort();
            }
        }
        let mut lines = reader.lines.lock().await;
        std::mem::take(&mut *lines)
    }
}

async fn drain_lines<R>(
    reader: R,
    channel: &'static str,
    stage: String,
    cycle: String,
    lines: Arc<Mutex<Vec<String>>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(|c| c == '\n' || c == '\r')
                    .to_string();
                debug!(target: TOOL_OUTPUT_TARGET, stage = %stage, cycle = %cycle, channel, "{line}");
                lines.lock().await.push(line);
            }
            Err(e) => {
                warn!(stage = %stage, channel, "Failed to read tool output: {e}");
                break;
            }
        }
    }
}
