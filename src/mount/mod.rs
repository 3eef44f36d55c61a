//! Dependencies made available inside the run sandbox.
//!
//! Every [`Mount`] is consumed twice: at build time [`Mount::stage`] writes
//! its artefacts below `deps/<kind>/<name>/`, and at run time the generated
//! run script executes the staged `extract.sh`, whose body is
//! [`Mount::extract_fragment`].

use std::fs;
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::script::{ScriptBuilder, quote};
use crate::store::{ObjectStore, StoreError};

mod filter;
mod git;
mod local;
mod object_store;

pub use filter::{DEFAULT_FILTER_DIRECTORIES, DEFAULT_FILTER_EXTENSIONS, FilterRules};
pub use git::GitMount;
pub use local::LocalMount;
pub use object_store::{DEFAULT_SYNC_INTERVAL_SECS, ObjectStoreMount};

/// Sandbox directory under which every object-store output mount lives.
///
/// Cloud backends sync this one prefix instead of enumerating mounts.
pub const SANDBOX_SYNC_ROOT: &str = "/satchel";

/// Variable exported by the run script holding its own process id.
pub const RUN_PID_VAR: &str = "SATCHEL_RUN_PID";

/// File name of the per-mount extraction script.
pub const EXTRACT_SCRIPT: &str = "extract.sh";

/// Data flow direction of a mount.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Code or data copied into the sandbox.
    ReadOnly,
    /// Output produced by the payload and carried back out.
    Writable,
}

/// Errors raised while validating or staging mounts.
#[derive(Debug, Error)]
pub enum MountError {
    /// Local I/O failed while copying or archiving a source.
    #[error("failed to stage {path}: {message}")]
    Staging {
        /// Path being staged.
        path: String,
        /// Underlying error message.
        message: String,
    },
    /// The requested mount capability is not implemented.
    #[error("not supported: {message}")]
    NotSupported {
        /// What was requested.
        message: String,
    },
    /// The mount point or remote path violates the mount's contract.
    #[error("invalid mount path {path}: {reason}")]
    InvalidMountPath {
        /// Offending path.
        path: String,
        /// Contract that was violated.
        reason: String,
    },
    /// An extraction fragment was requested before staging completed.
    #[error("mount {name} has not been staged")]
    NotStaged {
        /// Name of the mount.
        name: String,
    },
    /// Uploading a staged artefact failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MountError {
    pub(crate) fn staging(path: impl ToString, message: impl ToString) -> Self {
        Self::Staging {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn invalid_path(path: impl ToString, reason: &str) -> Self {
        Self::InvalidMountPath {
            path: path.to_string(),
            reason: reason.to_owned(),
        }
    }
}

/// Inputs available to mounts while staging.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    /// Root of the `deps/` tree inside the archive working directory.
    pub deps_root: &'a Utf8Path,
    /// Object store used for content-addressed data uploads, if configured.
    pub store: Option<&'a dyn ObjectStore>,
    /// Resolve object names without uploading anything.
    pub dry: bool,
}

/// One dependency of an archive.
#[derive(Clone, Debug)]
pub enum Mount {
    /// A host directory.
    Local(LocalMount),
    /// A git repository cloned inside the sandbox.
    Git(GitMount),
    /// An object-store prefix synced out of, or unpacked into, the sandbox.
    ObjectStore(ObjectStoreMount),
}

impl From<LocalMount> for Mount {
    fn from(mount: LocalMount) -> Self {
        Self::Local(mount)
    }
}

impl From<GitMount> for Mount {
    fn from(mount: GitMount) -> Self {
        Self::Git(mount)
    }
}

impl From<ObjectStoreMount> for Mount {
    fn from(mount: ObjectStoreMount) -> Self {
        Self::ObjectStore(mount)
    }
}

impl Mount {
    /// Deterministic name derived from the mount's source locator.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Local(mount) => mount.name(),
            Self::Git(mount) => mount.name(),
            Self::ObjectStore(mount) => mount.name(),
        }
    }

    /// Directory below `deps/` holding this kind of mount.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Git(_) => "git",
            Self::ObjectStore(_) => "store",
        }
    }

    /// Path of the mount inside the sandbox.
    #[must_use]
    pub fn mount_point(&self) -> &Utf8Path {
        match self {
            Self::Local(mount) => mount.mount_point(),
            Self::Git(mount) => mount.mount_point(),
            Self::ObjectStore(mount) => mount.mount_point(),
        }
    }

    /// Data flow direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Local(mount) => mount.direction(),
            Self::Git(_) => Direction::ReadOnly,
            Self::ObjectStore(mount) => mount.direction(),
        }
    }

    /// Entry appended to the search-path variable, when requested.
    #[must_use]
    pub fn search_path_entry(&self) -> Option<Utf8PathBuf> {
        match self {
            Self::Local(mount) => mount.search_path_entry(),
            Self::Git(mount) => mount.search_path_entry(),
            Self::ObjectStore(_) => None,
        }
    }

    /// Host directory and sandbox path to bind into a container, for
    /// writable local mounts.
    #[must_use]
    pub fn container_bind(&self) -> Option<(&Utf8Path, &Utf8Path)> {
        match self {
            Self::Local(mount) if mount.direction() == Direction::Writable => {
                Some((mount.source(), mount.mount_point()))
            }
            _ => None,
        }
    }

    /// Staging directory of this mount below `deps_root`.
    #[must_use]
    pub fn staging_dir(&self, deps_root: &Utf8Path) -> Utf8PathBuf {
        deps_root.join(self.kind()).join(self.name())
    }

    /// Path of the extraction script relative to the archive root.
    #[must_use]
    pub fn extract_script_path(&self) -> String {
        format!("./deps/{}/{}/{EXTRACT_SCRIPT}", self.kind(), self.name())
    }

    /// Command the run script uses to execute this mount's extraction.
    #[must_use]
    pub fn extract_command(&self) -> String {
        format!("sh {}", quote(&self.extract_script_path()))
    }

    /// Stages build-time artefacts and writes the extraction script.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Staging`] on local I/O failures,
    /// [`MountError::NotSupported`] when a required capability is missing
    /// and [`MountError::Store`] when an upload fails.
    pub fn stage(&mut self, ctx: &StageContext<'_>) -> Result<(), MountError> {
        let staging = self.staging_dir(ctx.deps_root);
        tracing::info!(mount = %self.name(), kind = self.kind(), "staging mount");
        match self {
            Self::Local(mount) => mount.stage(&staging)?,
            Self::Git(mount) => mount.stage(&staging)?,
            Self::ObjectStore(mount) => mount.stage(ctx)?,
        }
        fs::create_dir_all(&staging).map_err(|err| MountError::staging(&staging, err))?;
        write_extract_script(&staging, &self.extract_fragment()?)
    }

    /// Shell commands that materialise this mount inside the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NotStaged`] for read-only object-store mounts
    /// whose content key is only known after staging.
    pub fn extract_fragment(&self) -> Result<ScriptBuilder, MountError> {
        match self {
            Self::Local(mount) => Ok(mount.extract_fragment()),
            Self::Git(mount) => Ok(mount.extract_fragment()),
            Self::ObjectStore(mount) => mount.extract_fragment(),
        }
    }
}

fn write_extract_script(dir: &Utf8Path, fragment: &ScriptBuilder) -> Result<(), MountError> {
    let path = dir.join(EXTRACT_SCRIPT);
    let contents = format!("#!/bin/sh\n{}", fragment.dump_script());
    fs::write(&path, contents).map_err(|err| MountError::staging(&path, err))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .map_err(|err| MountError::staging(&path, err))
}

/// Parent directory of a sandbox path, `.` for bare relative names.
pub(crate) fn parent_or_current(path: &Utf8Path) -> &Utf8Path {
    match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    }
}

pub(crate) fn reject_trailing_separator(path: &Utf8Path) -> Result<(), MountError> {
    if path.as_str().len() > 1 && path.as_str().ends_with('/') {
        return Err(MountError::invalid_path(
            path,
            "mount points must not end with a path separator",
        ));
    }
    Ok(())
}
