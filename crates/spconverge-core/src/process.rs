use anyhow::{anyhow, Context, Result};
use std::process::{Command, Stdio};

use tracing::debug;

/// Runs `command` and fails with its status and captured output unless it
/// exits successfully.
pub fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    command_output(command, context_message).map(|_| ())
}

/// Like [`run_command`], returning the captured standard output.
pub fn command_output(command: &mut Command, context_message: &str) -> Result<String> {
    debug!(command = ?command, "running");
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}

/// Whether `command` exits successfully; its output is discarded.
pub fn command_succeeds(command: &mut Command, context_message: &str) -> Result<bool> {
    debug!(command = ?command, "checking");
    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    Ok(status.success())
}
