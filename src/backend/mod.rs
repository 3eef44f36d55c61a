//! Launch backends that execute a compiled bundle.
//!
//! Every backend reduces a [`LaunchRequest`] to a [`CommandPlan`]: setup
//! steps, one main command and cleanup steps. [`execute_plan`] then applies
//! the shared dry-run, output capture, detach and timeout semantics. Cloud
//! backends live in [`crate::cloud`] and provision instead of executing.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::cloud::{CloudError, ProvisionReceipt};
use crate::process::{ProcessError, ProcessLauncher, ProcessOutcome, ProcessSpec};

mod docker;
mod local;
mod ssh;

pub use docker::{DockerBackend, SCRIPT_MOUNT_ROOT};
pub use local::LocalBackend;
pub use ssh::{REMOTE_SCRIPT, SshBackend, SshOptions};

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Options common to every backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackendOptions {
    /// Interpreter that runs the bundle.
    pub shell_interpreter: String,
    /// Return as soon as the bundle has started.
    pub run_async: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            shell_interpreter: String::from("sh"),
            run_async: false,
        }
    }
}

impl BackendOptions {
    /// Options using `shell_interpreter`.
    pub fn new(shell_interpreter: impl Into<String>) -> Self {
        Self {
            shell_interpreter: shell_interpreter.into(),
            run_async: false,
        }
    }

    /// Sets asynchronous execution.
    #[must_use]
    pub const fn with_run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }
}

/// One launch of a bundle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Path of the bundle on the host.
    pub script: Utf8PathBuf,
    /// Arguments forwarded to the payload.
    pub cli_args: Vec<String>,
    /// Render commands without executing anything.
    pub dry: bool,
    /// Capture and return stdout.
    pub return_output: bool,
    /// Terminate a synchronous run after this long.
    pub timeout: Option<Duration>,
}

impl LaunchRequest {
    /// Request running `script` synchronously with inherited stdio.
    pub fn new(script: impl Into<Utf8PathBuf>) -> Self {
        Self {
            script: script.into(),
            cli_args: Vec::new(),
            dry: false,
            return_output: false,
            timeout: None,
        }
    }

    /// Sets forwarded payload arguments.
    #[must_use]
    pub fn cli_args(mut self, cli_args: Vec<String>) -> Self {
        self.cli_args = cli_args;
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub const fn dry(mut self, dry: bool) -> Self {
        self.dry = dry;
        self
    }

    /// Captures stdout.
    #[must_use]
    pub const fn return_output(mut self, return_output: bool) -> Self {
        self.return_output = return_output;
        self
    }

    /// Sets an optional timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// File name of the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::InvalidScript`] when the path has no file name.
    pub fn script_file_name(&self) -> Result<&str, BackendError> {
        self.script
            .file_name()
            .ok_or_else(|| BackendError::InvalidScript {
                path: self.script.clone(),
                reason: "path has no file name",
            })
    }

    /// Directory holding the bundle, `.` for bare file names.
    #[must_use]
    pub fn script_dir(&self) -> &Utf8Path {
        match self.script.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        }
    }
}

/// What a launch produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LaunchOutcome {
    /// Stdout was captured; the sentinel has not been stripped yet.
    Captured {
        /// Raw stdout.
        output: String,
        /// Exit code, absent when killed by a signal.
        exit_code: Option<i32>,
    },
    /// The bundle ran to completion with inherited stdio.
    Completed {
        /// Exit code, absent when killed by a signal.
        exit_code: Option<i32>,
    },
    /// The bundle was left running.
    Detached {
        /// Process id of the local group leader.
        pid: Option<u32>,
    },
    /// Nothing ran; these are the commands that would have.
    DryRun {
        /// Rendered command lines, in order.
        commands: Vec<String>,
    },
    /// A cloud instance was requested.
    Provisioned(ProvisionReceipt),
}

impl LaunchOutcome {
    /// Exit code for outcomes that ran to completion.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Captured { exit_code, .. } | Self::Completed { exit_code } => *exit_code,
            Self::Detached { .. } | Self::DryRun { .. } | Self::Provisioned(_) => Some(0),
        }
    }
}

/// Errors raised by launch backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The bundle path cannot be used.
    #[error("invalid bundle path {path}: {reason}")]
    InvalidScript {
        /// Offending path.
        path: Utf8PathBuf,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// A setup step such as copying the bundle failed.
    #[error("{command} exited with status {status_text}: {stderr}")]
    StepFailed {
        /// Rendered command line.
        command: String,
        /// Human readable exit status.
        status_text: String,
        /// Captured stderr.
        stderr: String,
    },
    /// Starting or waiting on a process failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// A cloud backend failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Executes bundles somewhere.
pub trait LaunchBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Launches `request`.
    fn launch<'a>(&'a self, request: &'a LaunchRequest)
    -> BackendFuture<'a, LaunchOutcome, BackendError>;
}

/// Commands a process-based backend runs for one launch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandPlan {
    /// Steps that must succeed before the main command.
    pub setup: Vec<ProcessSpec>,
    /// The command running the bundle.
    pub main: Option<ProcessSpec>,
    /// Best-effort steps after a synchronous main command.
    pub cleanup: Vec<ProcessSpec>,
}

impl CommandPlan {
    /// Plan consisting only of `main`.
    #[must_use]
    pub fn single(main: ProcessSpec) -> Self {
        Self {
            main: Some(main),
            ..Self::default()
        }
    }

    /// Rendered command lines in execution order.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.setup
            .iter()
            .chain(&self.main)
            .chain(&self.cleanup)
            .map(ProcessSpec::command_line)
            .collect()
    }
}

/// Runs `plan` with the request's dry-run, capture, detach and timeout
/// semantics.
///
/// # Errors
///
/// Returns [`BackendError::StepFailed`] when a setup step exits non-zero and
/// [`BackendError::Process`] when the main command cannot run to completion.
pub async fn execute_plan(
    launcher: &dyn ProcessLauncher,
    plan: CommandPlan,
    request: &LaunchRequest,
    options: &BackendOptions,
) -> Result<LaunchOutcome, BackendError> {
    if request.dry {
        return Ok(LaunchOutcome::DryRun {
            commands: plan.command_lines(),
        });
    }
    let CommandPlan {
        setup,
        main,
        cleanup,
    } = plan;

    for step in setup {
        run_step(launcher, &step).await?;
    }
    let Some(main_spec) = main else {
        return Ok(LaunchOutcome::Completed { exit_code: Some(0) });
    };

    let detach = options.run_async && !request.return_output;
    let spec = main_spec
        .capture_output(request.return_output)
        .detached(detach)
        .timeout(if detach { None } else { request.timeout });
    tracing::info!(command = %spec.command_line(), detach, "launching bundle");
    let outcome = launcher.launch(&spec).await;

    if !detach {
        for step in &cleanup {
            if let Err(err) = run_step(launcher, step).await {
                tracing::warn!(error = %err, "cleanup step failed");
            }
        }
    }

    match outcome? {
        ProcessOutcome::Detached { pid } => Ok(LaunchOutcome::Detached { pid }),
        ProcessOutcome::Exited { code, stdout, .. } if request.return_output => {
            Ok(LaunchOutcome::Captured {
                output: stdout,
                exit_code: code,
            })
        }
        ProcessOutcome::Exited { code, .. } => Ok(LaunchOutcome::Completed { exit_code: code }),
    }
}

async fn run_step(launcher: &dyn ProcessLauncher, step: &ProcessSpec) -> Result<(), BackendError> {
    let spec = step.clone().capture_output(true).detached(false);
    tracing::debug!(command = %spec.command_line(), "running step");
    match launcher.launch(&spec).await? {
        ProcessOutcome::Exited { code: Some(0), .. } | ProcessOutcome::Detached { .. } => Ok(()),
        ProcessOutcome::Exited { code, stderr, .. } => Err(BackendError::StepFailed {
            command: spec.command_line(),
            status_text: code.map_or_else(|| String::from("unknown"), |value| value.to_string()),
            stderr: stderr.trim().to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests;
