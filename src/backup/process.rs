//! Subprocess execution for native dump/restore tools

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backup::{BackupError, Result};

/// A command to run, with optional file redirection for stdin/stdout
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// File streamed into the child's stdin
    pub stdin: Option<PathBuf>,
    /// File receiving the child's stdout instead of the capture buffer
    pub stdout: Option<PathBuf>,
    /// Send stdout to the null device; ignored when `stdout` is set
    pub discard_stdout: bool,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            stdout: None,
            discard_stdout: false,
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

    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn discard_stdout(mut self) -> Self {
        self.discard_stdout = true;
        self
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Runs external commands to completion
///
/// A non-zero exit status is reported as `BackupError::SubprocessFailure`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands with tokio, capping the captured output
///
/// The cap covers stdout and stderr together and is enforced while the
/// child runs: the first read past it kills the child.
pub struct TokioProcessRunner {
    max_output_bytes: usize,
}

impl TokioProcessRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

fn failure(spec: &CommandSpec, message: impl Into<String>) -> BackupError {
    BackupError::SubprocessFailure {
        program: spec.program.clone(),
        message: message.into(),
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {} {}", spec.program, spec.args.join(" "));

        let mut command = Command::new(&spec.program);
        command.args(&spec.args).stderr(Stdio::piped()).kill_on_drop(true);

        match &spec.stdin {
            Some(path) => command.stdin(Stdio::from(std::fs::File::open(path)?)),
            None => command.stdin(Stdio::null()),
        };
        match &spec.stdout {
            Some(path) => command.stdout(Stdio::from(std::fs::File::create(path)?)),
            None if spec.discard_stdout => command.stdout(Stdio::null()),
            None => command.stdout(Stdio::piped()),
        };

        let mut child = command
            .spawn()
            .map_err(|e| failure(spec, format!("could not start: {}", e)))?;

        let captured = AtomicUsize::new(0);
        let limit = self.max_output_bytes;
        let output = tokio::try_join!(
            read_capped(spec, child.stdout.take(), &captured, limit),
            read_capped(spec, child.stderr.take(), &captured, limit),
        );
        let (stdout, stderr) = match output {
            Ok(output) => output,
            Err(e) => {
                if let Err(kill_error) = child.kill().await {
                    warn!("Could not kill {}: {}", spec.program, kill_error);
                }
                return Err(e);
            }
        };
        let status = child.wait().await?;

        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
        if !status.success() {
            let message = if stderr.is_empty() {
                format!("exited with {}", status)
            } else {
                format!("exited with {}: {}", status, stderr)
            };
            return Err(failure(spec, message));
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Read a child pipe to the end, failing as soon as the output shared by
/// all pipes of the child passes `limit`
async fn read_capped<R: AsyncRead + Unpin>(
    spec: &CommandSpec,
    pipe: Option<R>,
    captured: &AtomicUsize,
    limit: usize,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let Some(mut pipe) = pipe else {
        return Ok(buffer);
    };

    let mut chunk = [0u8; 8192];
    loop {
        let read = pipe.read(&mut chunk).await?;
        if read == 0 {
            return Ok(buffer);
        }
        if captured.fetch_add(read, Ordering::Relaxed) + read > limit {
            return Err(failure(spec, format!("output exceeded {} bytes", limit)));
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}
