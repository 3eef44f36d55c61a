//! Object-store access for bundle uploads, read-only data mounts and the
//! remote sync commands rendered into generated scripts.
//!
//! Host-side operations shell out to the provider CLIs through a
//! [`CommandRunner`]; the same [`StoreKind`] renders the commands that run
//! inside the sandbox, so both sides agree on tooling.

use std::ffi::OsString;

use camino::Utf8Path;
use thiserror::Error;

use crate::runner::{CommandRunner, ProcessCommandRunner, RunnerError};
use crate::script::quote;

mod tarball;

pub use tarball::{Tarball, pack_directory, write_tarball};

/// Remote prefix under which bundles, scripts and data tarballs are stored.
pub const MOUNT_PREFIX: &str = "satchel/mount";

/// Provider flavour of an object store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreKind {
    /// S3-compatible store driven by the `aws` CLI.
    S3,
    /// Google Cloud Storage driven by `gsutil`.
    Gcs,
}

impl StoreKind {
    /// URI scheme used for this store.
    #[must_use]
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Gcs => "gs",
        }
    }

    /// Shell command copying a single object between `source` and `dest`.
    #[must_use]
    pub fn copy_command(self, source: &str, dest: &str) -> String {
        match self {
            Self::S3 => format!("aws s3 cp --quiet {} {}", quote(source), quote(dest)),
            Self::Gcs => format!("gsutil -q cp {} {}", quote(source), quote(dest)),
        }
    }

    /// Shell command copying a directory tree recursively.
    #[must_use]
    pub fn recursive_copy_command(self, source: &str, dest: &str) -> String {
        match self {
            Self::S3 => format!(
                "aws s3 cp --quiet --recursive {} {}",
                quote(source),
                quote(dest)
            ),
            Self::Gcs => format!("gsutil -m -q cp -r {} {}", quote(source), quote(dest)),
        }
    }

    /// Shell command mirroring a local directory to a remote prefix.
    #[must_use]
    pub fn sync_command(self, source: &str, dest: &str) -> String {
        match self {
            Self::S3 => format!("aws s3 sync --quiet {} {}", quote(source), quote(dest)),
            Self::Gcs => format!("gsutil -m -q rsync -r {} {}", quote(source), quote(dest)),
        }
    }
}

/// Bucket-level address inside an object store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoreLocation {
    /// Provider flavour.
    pub kind: StoreKind,
    /// Bucket name without scheme.
    pub bucket: String,
}

impl StoreLocation {
    /// Creates an S3 location.
    pub fn s3(bucket: impl Into<String>) -> Self {
        Self {
            kind: StoreKind::S3,
            bucket: bucket.into(),
        }
    }

    /// Creates a GCS location.
    pub fn gcs(bucket: impl Into<String>) -> Self {
        Self {
            kind: StoreKind::Gcs,
            bucket: bucket.into(),
        }
    }

    /// Full URI of `path` inside this bucket.
    #[must_use]
    pub fn uri(&self, path: &str) -> String {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return format!("{}://{}", self.kind.scheme(), self.bucket);
        }
        format!("{}://{}/{trimmed}", self.kind.scheme(), self.bucket)
    }

    /// URI of an object stored under the shared mount prefix.
    #[must_use]
    pub fn mount_uri(&self, object: &str) -> String {
        self.uri(&format!("{MOUNT_PREFIX}/{object}"))
    }
}

/// Errors raised by object-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The provider CLI failed or could not be started.
    #[error(transparent)]
    Runner(#[from] RunnerError),
    /// Local archiving failed before upload.
    #[error("failed to archive {path}: {message}")]
    Archive {
        /// Directory being archived.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Host-side object-store operations.
pub trait ObjectStore: Send + Sync {
    /// Provider flavour, used to render matching in-sandbox commands.
    fn kind(&self) -> StoreKind;

    /// Returns whether an object exists at `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the provider CLI fails for reasons other
    /// than a missing object.
    fn exists(&self, uri: &str) -> Result<bool, StoreError>;

    /// Uploads `local` to `uri`, overwriting any existing object.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the upload fails.
    fn upload(&self, local: &Utf8Path, uri: &str) -> Result<(), StoreError>;
}

/// Result of a content-addressed upload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UploadOutcome {
    /// The object was transferred.
    Uploaded,
    /// An object with the same key already existed; nothing was sent.
    AlreadyPresent,
}

/// Uploads `local` to `uri` unless an object is already present there.
///
/// # Errors
///
/// Propagates [`StoreError`] from the existence check or upload.
pub fn upload_if_absent(
    store: &dyn ObjectStore,
    local: &Utf8Path,
    uri: &str,
) -> Result<UploadOutcome, StoreError> {
    if store.exists(uri)? {
        tracing::info!(%uri, "object already present, skipping upload");
        return Ok(UploadOutcome::AlreadyPresent);
    }
    store.upload(local, uri)?;
    tracing::info!(%uri, "uploaded object");
    Ok(UploadOutcome::Uploaded)
}

/// S3 store backed by the `aws` CLI.
#[derive(Clone, Debug)]
pub struct S3Store<R: CommandRunner> {
    runner: R,
    aws_bin: String,
    region: Option<String>,
}

impl S3Store<ProcessCommandRunner> {
    /// Creates a store wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(region: Option<String>) -> Self {
        Self::new(ProcessCommandRunner, region)
    }
}

impl<R: CommandRunner> S3Store<R> {
    /// Creates a store using `runner` and an optional default region.
    #[must_use]
    pub fn new(runner: R, region: Option<String>) -> Self {
        Self {
            runner,
            aws_bin: String::from("aws"),
            region,
        }
    }

    /// Overrides the `aws` executable.
    #[must_use]
    pub fn with_aws_bin(mut self, aws_bin: impl Into<String>) -> Self {
        self.aws_bin = aws_bin.into();
        self
    }

    fn args(&self, parts: &[&str]) -> Vec<OsString> {
        let mut args: Vec<OsString> = parts.iter().map(OsString::from).collect();
        if let Some(region) = &self.region {
            args.push(OsString::from("--region"));
            args.push(OsString::from(region));
        }
        args
    }
}

impl<R: CommandRunner> ObjectStore for S3Store<R> {
    fn kind(&self) -> StoreKind {
        StoreKind::S3
    }

    fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        let output = self.runner.run(&self.aws_bin, &self.args(&["s3", "ls", uri]))?;
        match output.code {
            Some(0) => Ok(!output.stdout.trim().is_empty()),
            Some(1) => Ok(false),
            _ => Err(output.into_failure(&self.aws_bin).into()),
        }
    }

    fn upload(&self, local: &Utf8Path, uri: &str) -> Result<(), StoreError> {
        self.runner.run_checked(
            &self.aws_bin,
            &self.args(&["s3", "cp", "--quiet", local.as_str(), uri]),
        )?;
        Ok(())
    }
}

/// GCS store backed by `gsutil`.
#[derive(Clone, Debug)]
pub struct GcsStore<R: CommandRunner> {
    runner: R,
    gsutil_bin: String,
}

impl GcsStore<ProcessCommandRunner> {
    /// Creates a store wired to the real process runner.
    #[must_use]
    pub fn with_process_runner() -> Self {
        Self::new(ProcessCommandRunner)
    }
}

impl<R: CommandRunner> GcsStore<R> {
    /// Creates a store using `runner`.
    #[must_use]
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            gsutil_bin: String::from("gsutil"),
        }
    }

    /// Overrides the `gsutil` executable.
    #[must_use]
    pub fn with_gsutil_bin(mut self, gsutil_bin: impl Into<String>) -> Self {
        self.gsutil_bin = gsutil_bin.into();
        self
    }
}

impl<R: CommandRunner> ObjectStore for GcsStore<R> {
    fn kind(&self) -> StoreKind {
        StoreKind::Gcs
    }

    fn exists(&self, uri: &str) -> Result<bool, StoreError> {
        let args = [OsString::from("-q"), OsString::from("stat"), OsString::from(uri)];
        let output = self.runner.run(&self.gsutil_bin, &args)?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(output.into_failure(&self.gsutil_bin).into()),
        }
    }

    fn upload(&self, local: &Utf8Path, uri: &str) -> Result<(), StoreError> {
        let args = [
            OsString::from("-q"),
            OsString::from("cp"),
            OsString::from(local.as_str()),
            OsString::from(uri),
        ];
        self.runner.run_checked(&self.gsutil_bin, &args)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
