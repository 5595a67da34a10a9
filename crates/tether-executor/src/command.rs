//! Command building and process jobs.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    process::Stdio,
};

use command_group::AsyncCommandGroup;
use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{debug, info};

use crate::{
    jobs::JobRunner,
    scheduler::{JobContext, JobError},
};

/// Lines of output kept per stream.
const DEFAULT_TAIL_LINES: usize = 50;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Resolve the program to an executable path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::NotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for job command lines.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base command line, shell-words split.
    pub base: String,
    /// Arguments appended verbatim.
    pub params: Vec<String>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: Vec::new(),
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Split the base and append the parameters.
    ///
    /// # Errors
    /// Returns error if the base cannot be parsed or nothing remains.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        parts.extend(self.params.iter().cloned());

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(CommandParts {
            program,
            args: parts,
        })
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(CommandBuildError::EmptyCommand)
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}

/// Resolve an executable by name.
///
/// Explicit paths are used as-is when they exist; bare names are looked
/// up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// RUN parameters understood by `ProcessRunner`.
#[derive(Debug, Deserialize)]
struct ProcessSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Runs each job as an OS process group.
///
/// The group is killed when the job is cancelled. The job value carries
/// the exit code and the tail of stdout and stderr.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    tail_lines: usize,
}

impl ProcessRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Keep at most `lines` lines of each output stream.
    #[must_use]
    pub const fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines;
        self
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRunner for ProcessRunner {
    fn run(&self, params: Value, ctx: JobContext) -> BoxFuture<'static, Result<Value, JobError>> {
        let spec = serde_json::from_value::<ProcessSpec>(params);
        let tail_lines = self.tail_lines;
        async move {
            let spec = spec.map_err(|e| JobError::InvalidParams(e.to_string()))?;
            run_process(spec, ctx, tail_lines).await
        }
        .boxed()
    }
}

async fn run_process(
    spec: ProcessSpec,
    ctx: JobContext,
    tail_lines: usize,
) -> Result<Value, JobError> {
    let parts = CommandBuilder::new(spec.command).params(spec.args).build()?;
    let (program, args) = parts.into_resolved().await?;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .envs(&spec.env)
        .env("TETHER_JOB_ID", &ctx.job_id)
        .env("TETHER_SLOT", &ctx.slot)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }

    let mut child = command.group_spawn()?;
    info!(job_id = %ctx.job_id, program = %program.display(), "Process started");

    let stdout = child.inner().stdout.take();
    let stderr = child.inner().stderr.take();
    let output = tokio::spawn(async move {
        let (stdout, stderr) = tokio::join!(tail(stdout, tail_lines), tail(stderr, tail_lines));
        json!({ "stdout": stdout, "stderr": stderr })
    });

    let status = tokio::select! {
        status = child.wait() => status?,
        () = ctx.cancel.cancelled() => {
            debug!(job_id = %ctx.job_id, "Killing process group");
            child.start_kill()?;
            let _ = child.wait().await;
            output.abort();
            return Err(JobError::Cancelled);
        }
    };

    let output = output.await.unwrap_or(Value::Null);
    if status.success() {
        Ok(json!({ "exit_code": status.code(), "output": output }))
    } else {
        Err(JobError::Exited {
            code: status.code(),
            output,
        })
    }
}

/// Last `limit` lines of a stream.
async fn tail<R>(reader: Option<R>, limit: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut kept = VecDeque::with_capacity(limit.min(1024));
    while let Ok(Some(line)) = lines.next_line().await {
        if kept.len() == limit {
            kept.pop_front();
        }
        if limit > 0 {
            kept.push_back(line);
        }
    }
    kept.into()
}
