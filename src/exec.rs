//! Bounded subprocess execution.
//!
//! Every external tool this server talks to (tmux, git, wt, ps, lsof) goes
//! through [`run_command`], which runs the process on the tokio runtime and
//! enforces a hard timeout so a wedged tool can never hang a connection.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::MuxError;

/// Captured result of one process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`MuxError::Failed`], returning stdout otherwise.
    pub fn into_stdout(self, program: &str, args: &[String]) -> Result<String, MuxError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(MuxError::Failed {
                program: program.to_string(),
                command: args.first().cloned().unwrap_or_default(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `program args...` with an optional working directory and a timeout.
///
/// The child is killed when the timeout elapses (`kill_on_drop`).
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput, MuxError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(program, ?args, "exec");

    let child = cmd.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            MuxError::Unavailable {
                program: program.to_string(),
                source,
            }
        } else {
            MuxError::Io {
                program: program.to_string(),
                source,
            }
        }
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(MuxError::Io {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(MuxError::Timeout {
                program: program.to_string(),
                timeout,
            })
        }
    };

    Ok(CommandOutput {
        // Killed by a signal: no exit code, report as generic failure.
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
