//! Running external tools (STILT, `xtrct_grid`, `xtrct_time`).

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, StiltError};

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout and stderr joined for error reports.
    pub fn transcript(&self) -> String {
        format!("stdout:\n{}\nstderr:\n{}", self.stdout, self.stderr)
    }
}

/// A command to run, optionally fed on stdin and bounded in time.
#[derive(Debug)]
pub struct ProcessSpec<'a> {
    program: &'a Path,
    args: Vec<String>,
    cwd: Option<&'a Path>,
    stdin: Option<String>,
    until: Option<Instant>,
}

impl<'a> ProcessSpec<'a> {
    pub fn new(program: &'a Path) -> Self {
        Self {
            program,
            args: Vec::new(),
            cwd: None,
            stdin: None,
            until: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: &'a Path) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Kill the child if it is still running at `until`.
    pub fn until(mut self, until: Instant) -> Self {
        self.until = Some(until);
        self
    }

    /// Spawn, feed stdin, and wait for exit.
    ///
    /// The child is killed when the limit passes or when the returned future
    /// is dropped, so an outer deadline never leaves it running.
    pub async fn run(self) -> Result<ProcessOutput> {
        let mut command = Command::new(self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = self.cwd {
            command.current_dir(cwd);
        }

        let program = self.program.display().to_string();
        debug!(program = %program, args = ?self.args, "spawning process");
        let mut child = command.spawn()?;

        if let (Some(input), Some(mut pipe)) = (self.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = match self.until {
            Some(until) => {
                let limit = until.saturating_duration_since(Instant::now());
                match tokio::time::timeout_at(until, child.wait_with_output())
                    .await
                {
                    Ok(output) => output?,
                    Err(_) => {
                        warn!(program = %program, ?limit, "process killed at limit");
                        return Err(StiltError::ProcessTimeout { program, limit });
                    }
                }
            }
            None => child.wait_with_output().await?,
        };

        Ok(ProcessOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
