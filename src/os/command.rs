//! Bounded external command execution.
//!
//! Every shell-out made by the adapter goes through [`CommandRunner`], which
//! enforces a timeout and kills the child if it is abandoned.

use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use super::error::{OsError, OsResult};

/// Default timeout for a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Captured output of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// Text to report on failure: stderr, or stdout when stderr is empty.
    ///
    /// `netsh` and `reg` print their errors on stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs external commands with a timeout.
#[derive(Debug, Clone, Copy)]
pub struct CommandRunner {
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandRunner {
    /// Create a runner with the given per-command timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// The configured per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a command and fail unless it exits successfully.
    pub async fn run(&self, program: &str, args: &[String]) -> OsResult<CommandOutput> {
        self.run_with_timeout(program, args, self.timeout).await
    }

    /// Like [`run`](Self::run) with an explicit timeout.
    pub async fn run_with_timeout(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> OsResult<CommandOutput> {
        let output = self.output_with_timeout(program, args, timeout).await?;
        if !output.success {
            return Err(OsError::CommandError {
                cmd: format_command(program, args),
                stderr: output.diagnostic(),
            });
        }
        Ok(output)
    }

    /// Run a command and return its output regardless of exit status.
    pub async fn output(&self, program: &str, args: &[String]) -> OsResult<CommandOutput> {
        self.output_with_timeout(program, args, self.timeout).await
    }

    async fn output_with_timeout(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> OsResult<CommandOutput> {
        let cmd_str = format_command(program, args);
        debug!("Running: {}", cmd_str);

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(result) => result.map_err(|e| OsError::CommandFailed {
                cmd: cmd_str.clone(),
                source: e,
            })?,
            Err(_) => {
                return Err(OsError::Timeout {
                    cmd: cmd_str,
                    timeout,
                });
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render a command line for logs and error messages.
pub fn format_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}
