//! Object-store prefixes: output directories synced out of the sandbox, or
//! read-only data unpacked from a content-addressed tarball.

use camino::{Utf8Path, Utf8PathBuf};

use super::{
    Direction, FilterRules, MountError, RUN_PID_VAR, SANDBOX_SYNC_ROOT, StageContext,
    reject_trailing_separator,
};
use crate::script::{BackgroundTask, ScriptBuilder, Trigger, quote};
use crate::store::{StoreLocation, upload_if_absent, write_tarball};

/// Seconds between periodic output syncs.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;

/// An object-store mount.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectStoreMount {
    location: StoreLocation,
    remote_path: String,
    name: String,
    mount_point: Utf8PathBuf,
    direction: Direction,
    source: Option<Utf8PathBuf>,
    filter: FilterRules,
    sync_interval_secs: u64,
    staged_object: Option<String>,
}

impl ObjectStoreMount {
    /// Output mount syncing `SANDBOX_SYNC_ROOT/<remote_path>` to
    /// `<location>/<remote_path>`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidMountPath`] when `remote_path` is empty or
    /// absolute; output mounts always live under the fixed sandbox root.
    pub fn output(location: StoreLocation, remote_path: &str) -> Result<Self, MountError> {
        if remote_path.starts_with('/') {
            return Err(MountError::invalid_path(
                remote_path,
                "object-store paths must be relative to the sandbox sync root",
            ));
        }
        let trimmed = remote_path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(MountError::invalid_path(
                remote_path,
                "object-store paths must not be empty",
            ));
        }
        let sync_dir = Utf8PathBuf::from(SANDBOX_SYNC_ROOT).join(trimmed);

        Ok(Self {
            location,
            remote_path: trimmed.to_owned(),
            name: sync_dir.as_str().replace('/', "_"),
            mount_point: sync_dir,
            direction: Direction::Writable,
            source: None,
            filter: FilterRules::default(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            staged_object: None,
        })
    }

    /// Read-only mount unpacking `source` at `mount_point`; the directory is
    /// uploaded once per distinct content hash while staging.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidMountPath`] when the mount point ends with
    /// a separator.
    pub fn input(
        location: StoreLocation,
        source: impl Into<Utf8PathBuf>,
        mount_point: &str,
    ) -> Result<Self, MountError> {
        let mount = Utf8PathBuf::from(mount_point);
        reject_trailing_separator(&mount)?;
        let source_path = source.into();

        Ok(Self {
            location,
            remote_path: String::new(),
            name: source_path.as_str().replace('/', "_"),
            mount_point: mount,
            direction: Direction::ReadOnly,
            source: Some(source_path),
            filter: FilterRules::default(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            staged_object: None,
        })
    }

    /// Overrides the periodic sync interval.
    #[must_use]
    pub const fn with_sync_interval(mut self, seconds: u64) -> Self {
        self.sync_interval_secs = seconds;
        self
    }

    /// Replaces the exclusion rules applied to read-only sources.
    #[must_use]
    pub fn with_filter(mut self, filter: FilterRules) -> Self {
        self.filter = filter;
        self
    }

    /// Sync directory with separators replaced by `_`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sandbox path.
    #[must_use]
    pub fn mount_point(&self) -> &Utf8Path {
        &self.mount_point
    }

    /// Data flow direction.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Store location this mount reads from or writes to.
    #[must_use]
    pub const fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Remote URI receiving synced output.
    #[must_use]
    pub fn destination_uri(&self) -> String {
        self.location.uri(&self.remote_path)
    }

    /// Remote URI of the uploaded tarball, once staged.
    #[must_use]
    pub fn staged_uri(&self) -> Option<String> {
        self.staged_object
            .as_deref()
            .map(|object| self.location.mount_uri(object))
    }

    pub(super) fn stage(&mut self, ctx: &StageContext<'_>) -> Result<(), MountError> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let store = ctx.store.ok_or_else(|| MountError::NotSupported {
            message: String::from("read-only object-store mounts need an object store client"),
        })?;
        if store.kind() != self.location.kind {
            return Err(MountError::NotSupported {
                message: format!(
                    "mount targets {} but the configured store is {}",
                    self.location.kind.scheme(),
                    store.kind().scheme()
                ),
            });
        }

        let scratch = tempfile::tempdir().map_err(|err| MountError::staging(source, err))?;
        let scratch_path = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| MountError::staging(source, "non UTF-8 temporary directory"))?;
        let tarball = write_tarball(source, &self.filter, scratch_path)
            .map_err(|err| MountError::staging(source, err))?;
        let object = tarball.object_name();
        let uri = self.location.mount_uri(&object);
        if ctx.dry {
            tracing::info!(uri = %uri, "dry run, upload skipped");
        } else {
            upload_if_absent(store, &tarball.path, &uri)?;
        }
        self.staged_object = Some(object);
        Ok(())
    }

    pub(super) fn extract_fragment(&self) -> Result<ScriptBuilder, MountError> {
        let kind = self.location.kind;
        let mut script = ScriptBuilder::new();
        let mount = quote(self.mount_point.as_str());
        script.append("mkdir -p", [mount.as_str()]);

        if self.direction == Direction::ReadOnly {
            let (Some(object), Some(uri)) = (&self.staged_object, self.staged_uri()) else {
                return Err(MountError::NotStaged {
                    name: self.name.clone(),
                });
            };
            let local = format!("/tmp/satchel_{object}");
            script
                .line(kind.copy_command(&uri, &local))
                .line(format!("tar -xzf {} -C {mount}", quote(&local)))
                .line(format!("rm -f {}", quote(&local)));
            return Ok(script);
        }

        let destination = self.destination_uri();
        let alive = format!("kill -0 \"${RUN_PID_VAR}\" 2>/dev/null");
        let mut push = ScriptBuilder::new();
        push.line(kind.sync_command(self.mount_point.as_str(), &destination));
        let periodic = BackgroundTask::new(
            Trigger::Every {
                seconds: self.sync_interval_secs,
                guard: alive.clone(),
            },
            push,
        );
        let mut flush = ScriptBuilder::new();
        flush.line(kind.recursive_copy_command(self.mount_point.as_str(), &destination));
        let terminal = BackgroundTask::new(
            Trigger::WhenCheckFails {
                check: alive,
                poll_seconds: 1,
            },
            flush,
        );
        script
            .line(periodic.with_redirect("> /dev/null 2>&1").render())
            .line(terminal.with_redirect("> /dev/null 2>&1").render());
        Ok(script)
    }
}
