//! One-call packaging and launch.
//!
//! [`Launcher::run_command`] builds a bundle for a payload command into a
//! scratch directory, hands it to the configured backend and strips the
//! sentinel banner from captured output. The scratch directory is removed
//! afterwards unless the backend detached from a process that still needs the
//! bundle.

use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::archive::{ArchiveBuilder, ArchiveError, ArchiveSpec, ContainerSpec, strip_banner};
use crate::backend::{BackendError, LaunchBackend, LaunchOutcome, LaunchRequest};
use crate::mount::Mount;

/// Errors raised by [`Launcher::run_command`].
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Building the bundle failed, or its output had no sentinel.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// The backend could not run or provision the bundle.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The scratch directory could not be created.
    #[error("failed to prepare scratch directory {path}: {message}")]
    Scratch {
        /// Directory being created.
        path: String,
        /// Underlying error.
        message: String,
    },
}

impl LaunchError {
    /// Whether the failure happened while packaging, before anything ran.
    #[must_use]
    pub const fn is_packaging_failure(&self) -> bool {
        match self {
            Self::Archive(err) => err.is_packaging_failure(),
            Self::Backend(_) => false,
            Self::Scratch { .. } => true,
        }
    }
}

/// Per-run options for [`Launcher::run_command`].
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Mounts staged into the bundle, in extraction order.
    pub mounts: Vec<Mount>,
    /// Optional container the payload runs in.
    pub container: Option<ContainerSpec>,
    /// Arguments forwarded to the payload.
    pub cli_args: Vec<String>,
    /// Render commands instead of running them.
    pub dry: bool,
    /// Capture payload output and return it.
    pub return_output: bool,
    /// Print bundle metadata when the bundle starts.
    pub verbose: bool,
    /// Limit on synchronous runs.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    /// Appends a mount.
    #[must_use]
    pub fn mount(mut self, mount: impl Into<Mount>) -> Self {
        self.mounts.push(mount.into());
        self
    }

    /// Sets the forwarded arguments.
    #[must_use]
    pub fn cli_args(mut self, cli_args: Vec<String>) -> Self {
        self.cli_args = cli_args;
        self
    }

    /// Sets the container spec.
    #[must_use]
    pub fn container(mut self, container: Option<ContainerSpec>) -> Self {
        self.container = container;
        self
    }

    /// Enables dry runs.
    #[must_use]
    pub const fn dry(mut self, dry: bool) -> Self {
        self.dry = dry;
        self
    }

    /// Enables output capture.
    #[must_use]
    pub const fn return_output(mut self, return_output: bool) -> Self {
        self.return_output = return_output;
        self
    }

    /// Enables the metadata banner.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Builds bundles and launches them on a single backend.
pub struct Launcher {
    builder: ArchiveBuilder,
    backend: Box<dyn LaunchBackend>,
    scratch_root: Utf8PathBuf,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("builder", &self.builder)
            .field("backend", &self.backend.name())
            .field("scratch_root", &self.scratch_root)
            .finish()
    }
}

impl Launcher {
    /// Creates a launcher that builds with `builder` and runs on `backend`.
    /// Scratch directories go to the system temporary directory.
    pub fn new(builder: ArchiveBuilder, backend: impl LaunchBackend + 'static) -> Self {
        Self::from_boxed(builder, Box::new(backend))
    }

    /// Same as [`Launcher::new`] for an already boxed backend.
    #[must_use]
    pub fn from_boxed(builder: ArchiveBuilder, backend: Box<dyn LaunchBackend>) -> Self {
        let scratch_root = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
        Self {
            builder,
            backend,
            scratch_root,
        }
    }

    /// Places scratch directories under `root`.
    #[must_use]
    pub fn with_scratch_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// Name of the configured backend.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Packages `command` with the mounts in `options` and launches it.
    ///
    /// Captured output is returned without the sentinel banner.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::Archive`] when packaging fails or captured
    /// output has no sentinel, and [`LaunchError::Backend`] when the backend
    /// fails.
    pub async fn run_command(
        &self,
        command: &str,
        options: RunOptions,
    ) -> Result<LaunchOutcome, LaunchError> {
        let RunOptions {
            mounts,
            container,
            cli_args,
            dry,
            return_output,
            verbose,
            timeout,
        } = options;

        let scratch = self
            .scratch_root
            .join(format!("satchel-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&scratch).map_err(|err| LaunchError::Scratch {
            path: scratch.to_string(),
            message: err.to_string(),
        })?;
        let bundle = scratch.join(format!("satchel_{}.sh", Uuid::new_v4().simple()));

        let mut spec = ArchiveSpec::new(command)
            .container(container)
            .verbose(verbose)
            .dry(dry);
        spec.mounts = mounts;

        let request = LaunchRequest::new(bundle.clone())
            .cli_args(cli_args)
            .dry(dry)
            .return_output(return_output)
            .timeout(timeout);
        let result = self.build_and_launch(spec, &request).await;
        let keep = matches!(result, Ok(LaunchOutcome::Detached { .. }));
        if keep {
            tracing::info!(bundle = %bundle, "detached run keeps its bundle");
        } else {
            remove_scratch(&scratch);
        }
        result
    }

    async fn build_and_launch(
        &self,
        spec: ArchiveSpec,
        request: &LaunchRequest,
    ) -> Result<LaunchOutcome, LaunchError> {
        self.builder.build(spec, &request.script)?;
        tracing::info!(
            backend = self.backend.name(),
            bundle = %request.script,
            dry = request.dry,
            "launching bundle"
        );
        let outcome = self.backend.launch(request).await?;
        match outcome {
            LaunchOutcome::Captured { output, exit_code } => {
                let payload = strip_banner(&output)
                    .map_err(|_| ArchiveError::SentinelMissing { exit_code })?;
                Ok(LaunchOutcome::Captured {
                    output: payload.to_owned(),
                    exit_code,
                })
            }
            other => Ok(other),
        }
    }
}

fn remove_scratch(dir: &Utf8Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        tracing::warn!(path = %dir, error = %err, "failed to remove scratch directory");
    }
}
