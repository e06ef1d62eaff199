//! Subprocess execution with timeouts and output streaming.
//!
//! All external tools (podman, kind, kubectl, df) are invoked through this
//! module. Every invocation carries a deadline and is spawned with
//! `kill_on_drop`, so a caller-side timeout actually terminates the external
//! process instead of leaving it running after the harness gives up.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::sink::Sink;
use crate::{Error, Result};

/// Default timeout for short administrative commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

fn command_line(cmd: &str, args: &[&str]) -> String {
    format!("{} {}", cmd, args.join(" "))
}

/// Run a command to completion and return its stdout.
///
/// Non-zero exit returns [`Error::Command`] carrying stderr; exceeding
/// `timeout` kills the process and returns [`Error::Timeout`].
pub async fn run(cmd: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let line = command_line(cmd, args);
    debug!(command = %line, "running");

    let output = tokio::time::timeout(
        timeout,
        Command::new(cmd).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| Error::timeout(line.clone(), timeout))?
    .map_err(|e| Error::command(line.clone(), format!("failed to spawn: {}", e)))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(Error::command(
            line,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

/// Run a command, piping `input` to its stdin, and return its stdout.
///
/// Used for generated documents that never touch disk: the kind cluster
/// config and `kubectl apply -f -` manifests.
pub async fn run_with_stdin(
    cmd: &str,
    args: &[&str],
    input: &str,
    timeout: Duration,
) -> Result<String> {
    let line = command_line(cmd, args);
    debug!(command = %line, "running with stdin");

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::command(line.clone(), format!("failed to spawn: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| Error::command(line.clone(), format!("failed to write stdin: {}", e)))?;
        // Drop closes the pipe so the child sees EOF.
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::timeout(line.clone(), timeout))?
        .map_err(|e| Error::command(line.clone(), e.to_string()))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(Error::command(
            line,
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

/// Run a command, forwarding stdout lines to the sink as they arrive.
///
/// Stderr is captured separately and returned in the error on failure, so
/// build logs stream live while diagnostics stay attached to the error.
pub async fn stream(cmd: &str, args: &[&str], timeout: Duration, sink: &Sink) -> Result<()> {
    let line = command_line(cmd, args);
    debug!(command = %line, "running with streamed output");

    let mut child = Command::new(cmd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::command(line.clone(), format!("failed to spawn: {}", e)))?;

    let stderr_handle = child.stderr.take();
    let stdout_handle = child.stdout.take();

    let drive = async {
        if let Some(stdout) = stdout_handle {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(out_line) = lines
                .next_line()
                .await
                .map_err(|e| Error::command(line.clone(), e.to_string()))?
            {
                sink.line(format!("    {}", out_line));
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::command(line.clone(), e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            let stderr_msg = match stderr_handle {
                Some(stderr) => {
                    let mut lines = BufReader::new(stderr).lines();
                    let mut collected = Vec::new();
                    while let Some(err_line) = lines.next_line().await.ok().flatten() {
                        collected.push(err_line);
                    }
                    collected.join("\n")
                }
                None => "command failed".to_string(),
            };
            Err(Error::command(line.clone(), stderr_msg))
        }
    };

    tokio::time::timeout(timeout, drive)
        .await
        .map_err(|_| Error::timeout(command_line(cmd, args), timeout))?
}

// =============================================================================
// Prerequisite Checks
// =============================================================================

/// Check if a tool is available on PATH.
pub async fn tool_exists(tool: &str) -> bool {
    Command::new("which")
        .arg(tool)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Verify that every required tool is installed, with install hints.
///
/// Run before any cluster or image work so a missing binary fails in
/// seconds instead of mid-pipeline.
pub async fn check_prerequisites(tools: &[(&str, &str)]) -> Result<()> {
    for (tool, hint) in tools {
        if !tool_exists(tool).await {
            return Err(Error::invalid_config(format!(
                "prerequisite not found: {} - {}",
                tool, hint
            )));
        }
        debug!(tool, "prerequisite found");
    }
    Ok(())
}

// =============================================================================
// kubectl
// =============================================================================

/// Run a kubectl command with built-in retry (3 attempts, backoff).
///
/// All kubectl invocations should go through this function so transient
/// API-server hiccups don't kill the run. Permanent errors (NotFound,
/// Forbidden, etc.) return immediately; "already exists" counts as success
/// since the desired state is achieved.
pub async fn kubectl(kubeconfig: &str, args: &[&str]) -> Result<String> {
    let mut full_args = vec!["--kubeconfig", kubeconfig];
    full_args.extend_from_slice(args);

    // The inner closure returns Ok(Ok(output)) for success, Ok(Err(e)) for
    // permanent errors (stops retrying), and Err(e) for transient errors.
    let result: std::result::Result<Result<String>, Error> =
        retry_with_backoff(&RetryConfig::default(), "kubectl", || {
            let args = full_args.clone();
            async move {
                match run("kubectl", &args, DEFAULT_COMMAND_TIMEOUT).await {
                    Ok(output) => Ok(Ok(output)),
                    Err(Error::Command { command, message }) if is_already_exists(&message) => {
                        debug!(command = %command, "target already exists, treating as success");
                        Ok(Ok(message))
                    }
                    Err(e @ Error::Command { .. })
                        if is_transient_kubectl_error(&e.to_string()) =>
                    {
                        Err(e)
                    }
                    Err(e @ Error::Timeout { .. }) => Err(e),
                    Err(e) => {
                        warn!(error = %e, "kubectl failed with a permanent error");
                        Ok(Err(e))
                    }
                }
            }
        })
        .await;

    match result {
        Ok(inner) => inner,
        Err(e) => Err(e),
    }
}

/// kubectl with a document piped to stdin (`kubectl apply -f -` and friends).
pub async fn kubectl_with_stdin(kubeconfig: &str, args: &[&str], input: &str) -> Result<String> {
    let mut full_args = vec!["--kubeconfig", kubeconfig];
    full_args.extend_from_slice(args);

    let result: std::result::Result<Result<String>, Error> =
        retry_with_backoff(&RetryConfig::default(), "kubectl", || {
            let args = full_args.clone();
            async move {
                match run_with_stdin("kubectl", &args, input, DEFAULT_COMMAND_TIMEOUT).await {
                    Ok(output) => Ok(Ok(output)),
                    Err(Error::Command { command, message }) if is_already_exists(&message) => {
                        debug!(command = %command, "target already exists, treating as success");
                        Ok(Ok(message))
                    }
                    Err(e @ Error::Command { .. })
                        if is_transient_kubectl_error(&e.to_string()) =>
                    {
                        Err(e)
                    }
                    Err(e) => Ok(Err(e)),
                }
            }
        })
        .await;

    match result {
        Ok(inner) => inner,
        Err(e) => Err(e),
    }
}

fn is_already_exists(error: &str) -> bool {
    error.contains("AlreadyExists") || error.contains("already exists")
}

/// Whether a kubectl error is transient (connection-level) and worth retrying.
fn is_transient_kubectl_error(error: &str) -> bool {
    error.contains("Unable to connect to the server")
        || error.contains("connection refused")
        || error.contains("connection reset")
        || error.contains("i/o timeout")
        || error.contains("TLS handshake timeout")
        || error.contains("no such host")
        || error.contains("dial tcp")
        || error.contains("EOF")
        || error.contains("broken pipe")
        || error.contains("context deadline exceeded")
        || error.contains("the object has been modified")
        || error.contains("InternalError")
        || error.contains("ServiceUnavailable")
        || error.contains("client rate limiter")
        || error.contains("timed out")
}
