//! Self-extracting bundle assembly and execution.
//!
//! [`ArchiveBuilder::build`] stages every mount into a scoped working tree,
//! writes `METADATA`, `run.sh` and an optional container hook, and hands the
//! tree to an [`ArchiveCompiler`]. The working tree is removed on every exit
//! path when its [`tempfile::TempDir`] guard drops.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::mount::{Mount, MountError, StageContext};
use crate::process::ProcessError;
use crate::store::ObjectStore;

mod bundle;
mod compiler;
mod container;
mod metadata;
mod output;
mod run_script;

pub use bundle::{BundleRun, bundle_invocation, run_bundle};
pub use compiler::{
    ARCHIVE_LABEL, ArchiveCompiler, CompileRequest, EmbeddedCompiler, MakeselfCompiler,
    PAYLOAD_MARKER, embedded_payload,
};
pub use container::{CONTAINER_PAYLOAD_ROOT, ContainerEngine, ContainerSpec};
pub use metadata::Metadata;
pub use output::{SENTINEL, strip_banner};
pub use run_script::RUN_SCRIPT;

/// File name of the container hook script.
pub const CONTAINER_SCRIPT: &str = "container.sh";

/// Default variable extended by search-path mounts.
pub const DEFAULT_SEARCH_PATH_VAR: &str = "PYTHONPATH";

/// Errors raised while building or running bundles.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// A mount failed validation or staging.
    #[error("build failed: {0}")]
    Mount(#[from] MountError),
    /// Writing the working tree failed.
    #[error("build failed: {message}")]
    Build {
        /// What went wrong.
        message: String,
    },
    /// The archive compiler did not produce a bundle.
    #[error("archive compilation failed: {message}")]
    Compile {
        /// What went wrong.
        message: String,
    },
    /// The bundle's stdout never contained the sentinel line.
    #[error(
        "bundle output has no '--- BEGIN OUTPUT ---' line (exit status {})",
        .exit_code.map_or_else(|| String::from("unknown"), |code| code.to_string())
    )]
    SentinelMissing {
        /// Exit code of the bundle, if known.
        exit_code: Option<i32>,
    },
    /// Running the bundle failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl ArchiveError {
    /// Returns `true` for failures that happen before anything runs.
    #[must_use]
    pub const fn is_packaging_failure(&self) -> bool {
        matches!(self, Self::Mount(_) | Self::Build { .. } | Self::Compile { .. })
    }

    fn build(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Build {
            message: format!("{context}: {err}"),
        }
    }
}

/// What goes into a bundle.
#[derive(Clone, Debug, Default)]
pub struct ArchiveSpec {
    /// Mounts, extracted in this order.
    pub mounts: Vec<Mount>,
    /// Shell command run after extraction; CLI arguments are appended.
    pub payload: String,
    /// Run the payload inside this container.
    pub container: Option<ContainerSpec>,
    /// Echo metadata and mount progress before the sentinel.
    pub verbose: bool,
    /// Stage without uploading mount data to the object store.
    pub dry: bool,
}

impl ArchiveSpec {
    /// Spec running `payload` with no mounts.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }

    /// Appends a mount.
    #[must_use]
    pub fn mount(mut self, mount: impl Into<Mount>) -> Self {
        self.mounts.push(mount.into());
        self
    }

    /// Sets the container spec.
    #[must_use]
    pub fn container(mut self, container: Option<ContainerSpec>) -> Self {
        self.container = container;
        self
    }

    /// Enables verbose extraction output.
    #[must_use]
    pub const fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Marks the build as part of a dry run.
    #[must_use]
    pub const fn dry(mut self, dry: bool) -> Self {
        self.dry = dry;
        self
    }
}

/// A compiled bundle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuiltArchive {
    /// Path of the executable bundle.
    pub path: Utf8PathBuf,
    /// Metadata embedded in it.
    pub metadata: Metadata,
}

/// Builds bundles with a given compiler.
pub struct ArchiveBuilder {
    compiler: Box<dyn ArchiveCompiler>,
    search_path_var: String,
    store: Option<Arc<dyn ObjectStore>>,
}

impl std::fmt::Debug for ArchiveBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveBuilder")
            .field("search_path_var", &self.search_path_var)
            .field("store", &self.store.as_ref().map(|store| store.kind()))
            .finish_non_exhaustive()
    }
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new(EmbeddedCompiler)
    }
}

impl ArchiveBuilder {
    /// Creates a builder using `compiler`.
    pub fn new(compiler: impl ArchiveCompiler + 'static) -> Self {
        Self::from_boxed(Box::new(compiler))
    }

    /// Creates a builder from a compiler chosen at runtime.
    #[must_use]
    pub fn from_boxed(compiler: Box<dyn ArchiveCompiler>) -> Self {
        Self {
            compiler,
            search_path_var: DEFAULT_SEARCH_PATH_VAR.to_owned(),
            store: None,
        }
    }

    /// Overrides the variable extended by search-path mounts.
    #[must_use]
    pub fn with_search_path_var(mut self, var: impl Into<String>) -> Self {
        self.search_path_var = var.into();
        self
    }

    /// Object store used by read-only object-store mounts.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds `spec` into an executable bundle at `output`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Mount`] or [`ArchiveError::Build`] when
    /// staging fails and [`ArchiveError::Compile`] when the compiler fails.
    /// The working tree is removed in every case.
    pub fn build(&self, spec: ArchiveSpec, output: &Utf8Path) -> Result<BuiltArchive, ArchiveError> {
        let ArchiveSpec {
            mut mounts,
            payload,
            container,
            verbose,
            dry,
        } = spec;
        if payload.trim().is_empty() {
            return Err(ArchiveError::Build {
                message: String::from("payload command is empty"),
            });
        }

        let work = tempfile::Builder::new()
            .prefix("satchel-build-")
            .tempdir()
            .map_err(|err| ArchiveError::build("creating working directory", err))?;
        let root = Utf8Path::from_path(work.path()).ok_or_else(|| ArchiveError::Build {
            message: String::from("working directory is not valid UTF-8"),
        })?;
        tracing::info!(mounts = mounts.len(), workdir = %root, "building bundle");

        let deps = root.join("deps");
        fs::create_dir_all(&deps).map_err(|err| ArchiveError::build("creating deps", err))?;
        let ctx = StageContext {
            deps_root: &deps,
            store: self.store.as_deref(),
            dry,
        };
        for mount in &mut mounts {
            mount.stage(&ctx)?;
        }

        let metadata = Metadata::generate();
        fs::write(root.join("METADATA"), metadata.render())
            .map_err(|err| ArchiveError::build("writing METADATA", err))?;

        let run_script =
            run_script::render_run_script(&mounts, &payload, verbose, &self.search_path_var);
        write_script(&root.join(RUN_SCRIPT), &run_script.dump_script())?;

        let entry = match &container {
            Some(container_spec) => {
                let hook = container::container_script(container_spec, &mounts, RUN_SCRIPT);
                write_script(&root.join(CONTAINER_SCRIPT), &hook.dump_script())?;
                CONTAINER_SCRIPT
            }
            None => RUN_SCRIPT,
        };

        self.compiler.compile(&CompileRequest {
            working_dir: root,
            output,
            label: ARCHIVE_LABEL,
            entry,
        })?;
        fs::set_permissions(output, fs::Permissions::from_mode(0o755))
            .map_err(|err| ArchiveError::Compile {
                message: format!("marking {output} executable: {err}"),
            })?;
        tracing::info!(bundle = %output, build_id = %metadata.build_id, "bundle built");

        Ok(BuiltArchive {
            path: output.to_path_buf(),
            metadata,
        })
    }
}

fn write_script(path: &Utf8Path, body: &str) -> Result<(), ArchiveError> {
    fs::write(path, format!("#!/bin/sh\n{body}"))
        .map_err(|err| ArchiveError::build(path.as_str(), err))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|err| ArchiveError::build(path.as_str(), err))
}
