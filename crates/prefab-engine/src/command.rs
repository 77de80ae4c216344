//! External command execution with a timeout and combined output capture.

use prefab_core::{Error, Result};
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// stdout followed by stderr.
    pub combined: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(1800))
    }
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run to completion. A nonzero exit is not an error here.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_in(None, program, args).await
    }

    pub async fn run_in(
        &self,
        dir: Option<&Path>,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        let line = command_line(program, args);
        debug!("exec: {}", line);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::command_failed(line, "spawn failed", e.to_string()));
            }
            Err(_) => {
                return Err(Error::CommandTimeout {
                    command: line,
                    secs: self.timeout.as_secs(),
                })
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CommandOutput {
            status: output.status,
            combined,
        })
    }

    /// Whether the command exits zero.
    pub async fn succeeds(&self, program: &str, args: &[&str]) -> Result<bool> {
        Ok(self.run(program, args).await?.success())
    }

    /// Run and turn a nonzero exit into `Error::CommandFailed`, logging the output.
    pub async fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        self.run_checked_in(None, program, args).await
    }

    pub async fn run_checked_in(
        &self,
        dir: Option<&Path>,
        program: &str,
        args: &[&str],
    ) -> Result<String> {
        let output = self.run_in(dir, program, args).await?;
        if output.success() {
            return Ok(output.combined);
        }
        let line = command_line(program, args);
        error!(command = %line, status = %output.status, "command failed:\n{}", output.combined);
        Err(Error::command_failed(
            line,
            output.status.to_string(),
            output.combined,
        ))
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().map(|a| a.to_string()));
    parts.join(" ")
}

/// Owned argument list helper for commands assembled from optional flags.
pub(crate) struct Args(Vec<String>);

impl Args {
    pub(crate) fn new() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn push(&mut self, arg: impl Into<String>) -> &mut Self {
        self.0.push(arg.into());
        self
    }

    pub(crate) fn push_path(&mut self, path: &Path) -> &mut Self {
        self.0.push(path.display().to_string());
        self
    }

    pub(crate) fn as_strs(&self) -> Vec<&str> {
        self.0.iter().map(String::as_str).collect()
    }
}
