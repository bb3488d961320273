//! ExternalToolRunner tests against real child processes
//!
//! Tests for:
//! - Dual-stream capture and working directory
//! - Structured per-line output logging
//! - Exit code propagation and spawn failures
//! - Cancellation: SIGTERM first, SIGKILL only after the grace period
//! - Process group isolation from the orchestrator

#![cfg(unix)]

mod support;

use std::path::Path;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpgid, getpgrp, Pid};
use selfcal::commands::RenderedCommand;
use selfcal::runner::TOOL_OUTPUT_TARGET;
use selfcal::{ExternalToolRunner, ToolExecutionError, ToolInvocation};
use selfcal_types::CycleDescriptor;
use support::{write_script, CapturedLogs};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn sh(dir: &Path, script: &Path, extra: &[&Path]) -> ToolInvocation {
    let mut argv = vec!["sh".to_string(), script.to_string_lossy().to_string()];
    argv.extend(extra.iter().map(|p| p.to_string_lossy().to_string()));
    ToolInvocation::new(
        "test.stage",
        RenderedCommand {
            tool: "fake-tool".to_string(),
            argv,
        },
        dir,
    )
}

async fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn read_pid(path: &Path) -> Pid {
    wait_for(path).await;
    let pid: i32 = std::fs::read_to_string(path).unwrap().trim().parse().unwrap();
    Pid::from_raw(pid)
}

// ============================================================================
// Capture
// ============================================================================

#[tokio::test]
async fn test_captures_both_streams() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "tool.sh",
        "echo out1\necho err1 >&2\necho out2\nprintf 'no newline'",
    );

    let result = ExternalToolRunner::default()
        .run(&sh(dir.path(), &script, &[]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout_lines, vec!["out1", "out2", "no newline"]);
    assert_eq!(result.stderr_lines, vec!["err1"]);
}

#[tokio::test]
async fn test_each_output_line_is_logged_with_its_context() {
    let (logs, _guard) = CapturedLogs::install();
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "tool.sh", "echo imaging-progress\necho gridding-warning >&2");
    let cycle = CycleDescriptor {
        index: 1,
        total_cycles: 3,
        clean_iterations: 100,
        is_phase_only: false,
        is_final: false,
    };
    let invocation = sh(dir.path(), &script, &[]).with_cycle(cycle);

    ExternalToolRunner::default()
        .run(&invocation, &CancellationToken::new())
        .await
        .unwrap();

    for (text, channel) in [("imaging-progress", "stdout"), ("gridding-warning", "stderr")] {
        let line = logs.line_with(text);
        assert!(line.contains("DEBUG"), "{line}");
        assert!(line.contains(TOOL_OUTPUT_TARGET), "{line}");
        assert!(line.contains("stage=test.stage"), "{line}");
        assert!(line.contains("cycle=2/3"), "{line}");
        assert!(line.contains("channel="), "{line}");
        assert!(line.contains(channel), "{line}");
    }
}

#[tokio::test]
async fn test_lines_read_before_a_stuck_pipe_are_kept() {
    let dir = TempDir::new().unwrap();
    // The background sleep inherits stdout and keeps it open after exit.
    let script = write_script(dir.path(), "tool.sh", "echo before\nsleep 30 2>/dev/null &\nexit 0");

    let started = Instant::now();
    let result = ExternalToolRunner::default()
        .run(&sh(dir.path(), &script, &[]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.stdout_lines, vec!["before"]);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_runs_in_working_directory() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    let script = write_script(dir.path(), "tool.sh", "pwd");

    let result = ExternalToolRunner::default()
        .run(&sh(&work, &script, &[]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        Path::new(&result.stdout_lines[0]).canonicalize().unwrap(),
        work.canonicalize().unwrap()
    );
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_non_zero_exit_is_an_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "tool.sh", "echo failing >&2\nexit 3");

    let err = ExternalToolRunner::default()
        .run(&sh(dir.path(), &script, &[]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ToolExecutionError::NonZeroExit { .. }));
    assert_eq!(err.exit_code(), Some(3));
    assert_eq!(err.program(), "fake-tool");
}

#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let dir = TempDir::new().unwrap();
    let invocation = ToolInvocation::new(
        "test.stage",
        RenderedCommand {
            tool: "missing".to_string(),
            argv: vec!["/nonexistent/selfcal-tool".to_string()],
        },
        dir.path(),
    );

    let err = ExternalToolRunner::default()
        .run(&invocation, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ToolExecutionError::Spawn { .. }));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancellation_sends_sigterm_before_kill() {
    let dir = TempDir::new().unwrap();
    let ready = dir.path().join("ready");
    let marker = dir.path().join("terminated");
    let script = write_script(
        dir.path(),
        "tool.sh",
        "trap 'echo term > \"$2\"; exit 143' TERM\ntouch \"$1\"\nwhile true; do sleep 0.1; done",
    );
    let invocation = sh(dir.path(), &script, &[&ready, &marker]);
    let cancel = CancellationToken::new();

    let runner = ExternalToolRunner::new(Duration::from_secs(5));
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(&invocation, &cancel).await })
    };

    wait_for(&ready).await;
    let started = Instant::now();
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "term");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_tool_ignoring_sigterm_is_killed_after_grace() {
    let dir = TempDir::new().unwrap();
    let ready = dir.path().join("ready");
    let script = write_script(
        dir.path(),
        "tool.sh",
        "trap '' TERM\ntouch \"$1\"\nwhile true; do sleep 0.1; done",
    );
    let invocation = sh(dir.path(), &script, &[&ready]);
    let cancel = CancellationToken::new();

    let runner = ExternalToolRunner::new(Duration::from_millis(300));
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(&invocation, &cancel).await })
    };

    wait_for(&ready).await;
    let started = Instant::now();
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();

    assert!(err.is_cancelled());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_tool_dying_from_a_signal_during_cancellation_is_cancelled() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("pid");
    let script = write_script(
        dir.path(),
        "tool.sh",
        "trap 'exit 130' INT\necho $$ > \"$1.tmp\" && mv \"$1.tmp\" \"$1\"\nwhile true; do sleep 0.1; done",
    );
    let invocation = sh(dir.path(), &script, &[&pid_file]);
    let cancel = CancellationToken::new();

    let runner = ExternalToolRunner::new(Duration::from_secs(5));
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(&invocation, &cancel).await })
    };

    let pid = read_pid(&pid_file).await;
    let started = Instant::now();
    // Ctrl-C reaching both the tool and the orchestrator at once.
    kill(pid, Signal::SIGINT).unwrap();
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();

    assert!(err.is_cancelled(), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

// ============================================================================
// Process group
// ============================================================================

#[tokio::test]
async fn test_tool_runs_in_its_own_process_group() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("pid");
    let script = write_script(
        dir.path(),
        "tool.sh",
        "echo $$ > \"$1.tmp\" && mv \"$1.tmp\" \"$1\"\nwhile true; do sleep 0.1; done",
    );
    let invocation = sh(dir.path(), &script, &[&pid_file]);
    let cancel = CancellationToken::new();

    let runner = ExternalToolRunner::new(Duration::from_secs(5));
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(&invocation, &cancel).await })
    };

    let pid = read_pid(&pid_file).await;
    let group = getpgid(Some(pid)).unwrap();
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();

    assert_eq!(group, pid);
    assert_ne!(group, getpgrp());
    assert!(err.is_cancelled());
}
