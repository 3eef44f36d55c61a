//! Process-group aware execution of bundles and backend commands.
//!
//! Children are spawned in their own process group so a timeout or an
//! interrupt can terminate the whole tree the payload started, not just the
//! immediate shell.

use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

mod termination;

use termination::terminate_process_group;

/// Default time a terminated group gets to exit before `SIGKILL`.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long output pipes are drained after the child exits. Descendants
/// that keep a pipe open past this point do not hold up the run.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Description of a process to start.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Capture stdout and stderr instead of inheriting them.
    pub capture: bool,
    /// Return as soon as the process has started.
    pub detach: bool,
    /// Terminate the process group after this long.
    pub timeout: Option<Duration>,
}

impl ProcessSpec {
    /// Creates a spec running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            capture: false,
            detach: false,
            timeout: None,
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Captures output when `capture` is set.
    #[must_use]
    pub const fn capture_output(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    /// Detaches from the process when `detach` is set.
    #[must_use]
    pub const fn detached(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Sets an optional timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-like rendering used for dry runs and logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut parts = vec![crate::script::quote(&self.program)];
        parts.extend(
            self.args
                .iter()
                .map(|arg| crate::script::quote(&arg.to_string_lossy())),
        );
        parts.join(" ")
    }
}

/// Result of a launched process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// The process ran to completion.
    Exited {
        /// Exit code, absent when killed by a signal.
        code: Option<i32>,
        /// Captured stdout, empty when not capturing.
        stdout: String,
        /// Captured stderr, empty when not capturing.
        stderr: String,
    },
    /// The process was left running in the background.
    Detached {
        /// Process id of the group leader.
        pid: Option<u32>,
    },
}

/// Errors raised while running a process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProcessError {
    /// Raised when the process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the process outlived its timeout; its group was killed.
    #[error("{program} timed out after {timeout_secs}s and was terminated")]
    TimedOut {
        /// Program that timed out.
        program: String,
        /// Timeout that elapsed, in seconds.
        timeout_secs: u64,
    },
    /// Raised when an interrupt arrived; the process group was terminated.
    #[error("{program} was interrupted and terminated")]
    Interrupted {
        /// Program that was running.
        program: String,
    },
    /// Raised when waiting on the process failed.
    #[error("failed waiting for {program}: {message}")]
    Wait {
        /// Program being awaited.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Boxed future returned by [`ProcessLauncher::launch`].
pub type LaunchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ProcessOutcome, ProcessError>> + Send + 'a>>;

/// Starts processes described by a [`ProcessSpec`].
pub trait ProcessLauncher: Send + Sync {
    /// Starts `spec` and waits according to its options.
    fn launch<'a>(&'a self, spec: &'a ProcessSpec) -> LaunchFuture<'a>;
}

/// Launcher spawning each process in a fresh process group.
#[derive(Clone, Copy, Debug)]
pub struct GroupProcessLauncher {
    grace: Duration,
}

impl Default for GroupProcessLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl GroupProcessLauncher {
    /// Creates a launcher with the given termination grace period.
    #[must_use]
    pub const fn new(grace: Duration) -> Self {
        Self { grace }
    }

    async fn run(&self, spec: &ProcessSpec) -> Result<ProcessOutcome, ProcessError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if spec.capture {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else if spec.detach {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }

        let mut child: AsyncGroupChild =
            command.group_spawn().map_err(|err| ProcessError::Spawn {
                program: spec.program.clone(),
                message: err.to_string(),
            })?;

        if spec.detach && !spec.capture {
            let pid = child.inner().id();
            tracing::info!(program = %spec.program, ?pid, "process detached");
            return Ok(ProcessOutcome::Detached { pid });
        }

        let stdout_task = child.inner().stdout.take().map(spawn_reader);
        let stderr_task = child.inner().stderr.take().map(spawn_reader);

        enum ExitReason {
            Completed(std::io::Result<std::process::ExitStatus>),
            Timeout,
            Interrupted,
        }

        let reason = tokio::select! {
            status = child.wait() => ExitReason::Completed(status),
            () = deadline(spec.timeout) => ExitReason::Timeout,
            () = interrupted() => ExitReason::Interrupted,
        };

        match reason {
            ExitReason::Completed(Ok(status)) => Ok(ProcessOutcome::Exited {
                code: status.code(),
                stdout: collect(stdout_task).await,
                stderr: collect(stderr_task).await,
            }),
            ExitReason::Completed(Err(err)) => Err(ProcessError::Wait {
                program: spec.program.clone(),
                message: err.to_string(),
            }),
            ExitReason::Timeout => {
                let timeout_secs = spec.timeout.map_or(0, |timeout| timeout.as_secs());
                tracing::warn!(program = %spec.program, timeout_secs, "process timed out");
                terminate_process_group(&mut child, self.grace).await;
                abort(stdout_task);
                abort(stderr_task);
                Err(ProcessError::TimedOut {
                    program: spec.program.clone(),
                    timeout_secs,
                })
            }
            ExitReason::Interrupted => {
                tracing::warn!(program = %spec.program, "interrupt received, terminating");
                terminate_process_group(&mut child, self.grace).await;
                abort(stdout_task);
                abort(stderr_task);
                Err(ProcessError::Interrupted {
                    program: spec.program.clone(),
                })
            }
        }
    }
}

impl ProcessLauncher for GroupProcessLauncher {
    fn launch<'a>(&'a self, spec: &'a ProcessSpec) -> LaunchFuture<'a> {
        Box::pin(self.run(spec))
    }
}

/// Background task collecting one output pipe until EOF or until stopped.
struct OutputReader {
    handle: JoinHandle<Vec<u8>>,
    stop: oneshot::Sender<()>,
}

fn spawn_reader<R>(mut reader: R) -> OutputReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (stop, mut stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0_u8; 8192];
        loop {
            tokio::select! {
                biased;
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(len) => buf.extend_from_slice(chunk.get(..len).unwrap_or_default()),
                    Err(err) => {
                        tracing::warn!(error = %err, "failed reading child output");
                        break;
                    }
                },
                _ = &mut stopped => break,
            }
        }
        buf
    });
    OutputReader { handle, stop }
}

async fn collect(reader: Option<OutputReader>) -> String {
    let Some(OutputReader { mut handle, stop }) = reader else {
        return String::new();
    };
    let bytes = match tokio::time::timeout(OUTPUT_DRAIN, &mut handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            tracing::debug!("output pipe still open after exit, stopping reader");
            stop.send(()).ok();
            handle.await.unwrap_or_default()
        }
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

fn abort(reader: Option<OutputReader>) {
    if let Some(output) = reader {
        output.handle.abort();
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
