//! Captured command execution for provider CLIs and helper tools.
//!
//! Everything that shells out to `aws`, `gsutil`, `gcloud`, `makeself` or
//! `git` goes through [`CommandRunner`] so tests can replace the host with a
//! scripted fake.

use std::ffi::OsString;
use std::process::Command;

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status used in error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }

    /// Converts a non-zero exit into [`RunnerError::CommandFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::CommandFailure`] when the exit code is not zero.
    pub fn check(self, program: &str) -> Result<Self, RunnerError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(self.into_failure(program))
    }

    /// Describes this output as a failure of `program`.
    #[must_use]
    pub fn into_failure(self, program: &str) -> RunnerError {
        RunnerError::CommandFailure {
            program: program.to_owned(),
            status: self.code,
            status_text: self.status_text(),
            stderr: self.stderr,
        }
    }
}

/// Errors raised while executing external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError>;

    /// Runs `program` and fails unless it exits with status zero.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started or
    /// [`RunnerError::CommandFailure`] when it exits unsuccessfully.
    fn run_checked(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        self.run(program, args)?.check(program)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        (**self).run(program, args)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        tracing::debug!(program, arg_count = args.len(), "running command");
        let mut command = Command::new(program);
        command.args(args);
        capture(&mut command, program)
    }
}

/// Process runner that adds fixed environment variables to every child,
/// used to hand provider credentials to their CLIs.
#[derive(Clone, Default)]
pub struct EnvCommandRunner {
    envs: Vec<(String, String)>,
}

impl std::fmt::Debug for EnvCommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.envs.iter().map(|(key, _)| key.as_str()).collect();
        f.debug_struct("EnvCommandRunner").field("keys", &keys).finish()
    }
}

impl EnvCommandRunner {
    /// Creates a runner exporting `envs` to each command.
    pub fn new(envs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            envs: envs.into_iter().collect(),
        }
    }
}

impl CommandRunner for EnvCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RunnerError> {
        tracing::debug!(program, arg_count = args.len(), env_count = self.envs.len(), "running command");
        let mut command = Command::new(program);
        command.args(args).envs(self.envs.iter().map(|(key, value)| (key, value)));
        capture(&mut command, program)
    }
}

fn capture(command: &mut Command, program: &str) -> Result<CommandOutput, RunnerError> {
    let output = command.output().map_err(|err| RunnerError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    })?;

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
