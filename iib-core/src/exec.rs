//! External command execution
//!
//! Every `opm`, `podman` and `skopeo` call goes through [`CommandRunner`] so
//! that the catalog operations can be exercised with a recording fake.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{IibError, Result};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A fully built external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Prefix of the error raised when the command fails
    pub error_context: String,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, error_context: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            error_context: error_context.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append `flag` only when `enabled`
    pub fn flag_if(self, enabled: bool, flag: &str) -> Self {
        if enabled {
            self.arg(flag)
        } else {
            self
        }
    }

    /// Append `flag value` only when a value is present
    pub fn opt_arg(self, flag: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value),
            None => self,
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn failed(&self, detail: impl Into<String>) -> IibError {
        IibError::ToolFailed {
            context: self.error_context.clone(),
            detail: detail.into(),
        }
    }

    fn to_process(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and return stdout
    async fn run(&self, cmd: &ToolCommand) -> Result<String>;

    /// Start `cmd` and wait until it exits or `ready` appears, then stop it
    ///
    /// Waiting longer than `wait` is an error. A clean exit without `ready`
    /// is not; callers check for the artifact themselves.
    async fn run_until_ready(&self, cmd: &ToolCommand, ready: &Path, wait: Duration)
        -> Result<()>;
}

/// Runs commands as local child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

fn failure_detail(stdout: &[u8], stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        return stderr.trim().to_string();
    }
    String::from_utf8_lossy(stdout).trim().to_string()
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &ToolCommand) -> Result<String> {
        info!("Running the command \"{}\"", cmd);

        let output = cmd
            .to_process()
            .output()
            .await
            .map_err(|e| cmd.failed(format!("failed to start {}: {e}", cmd.program)))?;

        if !output.status.success() {
            let detail = failure_detail(&output.stdout, &output.stderr);
            warn!(command = %cmd, status = %output.status, "Command failed: {}", detail);
            return Err(cmd.failed(detail));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_until_ready(
        &self,
        cmd: &ToolCommand,
        ready: &Path,
        wait: Duration,
    ) -> Result<()> {
        info!("Starting the command \"{}\"", cmd);

        let mut child = cmd
            .to_process()
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| cmd.failed(format!("failed to start {}: {e}", cmd.program)))?;

        let deadline = Instant::now() + wait;
        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    debug!(command = %cmd, "Command exited");
                    return Ok(());
                }
                let mut stderr = Vec::new();
                if let Some(mut pipe) = child.stderr.take() {
                    pipe.read_to_end(&mut stderr).await?;
                }
                return Err(cmd.failed(failure_detail(&[], &stderr)));
            }

            if ready.exists() {
                debug!(command = %cmd, ready = %ready.display(), "Artifact ready, stopping command");
                child.kill().await?;
                return Ok(());
            }

            if Instant::now() >= deadline {
                child.kill().await?;
                return Err(cmd.failed(format!(
                    "{} was not created within {} seconds",
                    ready.display(),
                    wait.as_secs()
                )));
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}
