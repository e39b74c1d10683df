//! Deadline-bounded subprocess execution.
//!
//! Every git, `gh` and agent invocation goes through [`run`], so nothing the
//! orchestrator shells out to can suspend a sweep indefinitely.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::CommandError;

/// Captured output of a successful command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...` in `cwd`, failing on non-zero exit or when the
/// deadline passes. The child is killed when the deadline is hit.
pub async fn run(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    run_with_input(program, args, cwd, None, timeout).await
}

/// Like [`run`], but feeds `input` to the child's stdin. Used for prompts,
/// which can exceed the per-argument size limit.
pub async fn run_with_input(
    program: &str,
    args: &[&str],
    cwd: &Path,
    input: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let rendered = render(program, args);
    let spawn_error = |source| CommandError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(spawn_error)?;

    if let Some(input) = input
        && let Some(mut stdin) = child.stdin.take()
    {
        let input = input.to_string();
        tokio::spawn(async move {
            // A child that exits without draining stdin yields a broken pipe;
            // its exit status is what gets reported.
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(spawn_error)?,
        Err(_) => {
            return Err(CommandError::TimedOut {
                command: rendered,
                timeout,
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        return Err(CommandError::Failed {
            command: rendered,
            status: output.status.code(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

/// Render a command line for error messages. Long arguments (prompts,
/// bodies) are elided.
fn render(program: &str, args: &[&str]) -> String {
    let mut parts = vec![program.to_string()];
    for arg in args {
        if arg.len() > 80 || arg.contains('\n') {
            parts.push("<...>".to_string());
        } else {
            parts.push((*arg).to_string());
        }
    }
    parts.join(" ")
}
