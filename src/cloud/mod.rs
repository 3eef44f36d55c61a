//! Cloud backends: spot instances and standard or preemptible compute
//! instances.
//!
//! Both upload the bundle to object storage, render a bootstrap script that
//! downloads and runs it while syncing `/satchel` back to the bucket, and ask
//! the provider CLI for an instance. Nothing is returned from the payload;
//! callers get a [`ProvisionReceipt`] instead.

use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use thiserror::Error;

use crate::credentials::CredentialsError;
use crate::runner::RunnerError;
use crate::store::StoreError;
use crate::util::write_ambient;

mod bootstrap;
mod compute;
mod spot;
mod tag;

pub use bootstrap::{
    BootstrapScript, EC2_LOG_FILE, GCE_LOG_FILE, OVERSIZE_PREFIX, Provider, USER_DATA_LIMIT,
    exceeds_user_data_limit,
};
pub use compute::{ALLOWED_GPUS, ComputeConfig, ComputeInstanceBackend, GpuSpec};
pub use spot::{SpotConfig, SpotInstanceBackend};
pub use tag::{TAG_ATTEMPTS, TagOutcome, tag_with_retry};

/// Where an instance should be placed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Let the tool pick; not implemented.
    Auto,
    /// A concrete region or zone.
    Named(String),
}

impl Placement {
    /// Parses `auto` or a concrete name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Named(value.trim().to_owned())
        }
    }

    /// The concrete name.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::NotImplemented`] for [`Placement::Auto`].
    pub fn resolve(&self, what: &'static str) -> Result<&str, CloudError> {
        match self {
            Self::Auto => Err(CloudError::NotImplemented {
                feature: format!("automatic {what} selection"),
            }),
            Self::Named(name) => Ok(name),
        }
    }
}

/// Errors raised by cloud backends.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The requested behaviour does not exist yet.
    #[error("not implemented: {feature}")]
    NotImplemented {
        /// What was requested.
        feature: String,
    },
    /// The backend cannot honour a request option.
    #[error("{backend} does not support {operation}")]
    UnsupportedOperation {
        /// Backend name.
        backend: &'static str,
        /// Rejected option.
        operation: &'static str,
    },
    /// A GPU model outside the supported list was requested.
    #[error("unsupported GPU model {model}")]
    InvalidGpu {
        /// Requested model.
        model: String,
    },
    /// A provider CLI call failed.
    #[error(transparent)]
    CommandFailure(#[from] RunnerError),
    /// A provider response could not be understood.
    #[error("failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Parser error.
        message: String,
    },
    /// Uploading the bundle or bootstrap failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Account details were missing.
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    /// Writing a local scratch file failed.
    #[error("failed to write {path}: {message}")]
    Scratch {
        /// File being written.
        path: String,
        /// Underlying error.
        message: String,
    },
}

/// What a cloud launch created.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionReceipt {
    /// Backend that created the resources.
    pub backend: &'static str,
    /// Job name used for tags and log paths.
    pub exp_name: String,
    /// Spot request id, for spot launches.
    pub request_id: Option<String>,
    /// Instance name, for compute launches.
    pub instance_name: Option<String>,
    /// Where the bundle was uploaded.
    pub bundle_uri: String,
    /// Where outputs and logs are synced.
    pub log_uri: String,
    /// Whether the launch tags were applied.
    pub tagged: bool,
    /// Non-fatal problems, such as exhausted tag retries.
    pub warnings: Vec<String>,
}

/// `<prefix>-<milliseconds since the epoch>`.
#[must_use]
pub fn exp_name(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    format!("{prefix}-{millis}")
}

/// `<log_path>/<prefix with '_' replaced by '-'>/<exp_name>`.
#[must_use]
pub fn job_base_path(log_path: &str, prefix: &str, exp_name: &str) -> String {
    let trimmed = log_path.trim_matches('/');
    let folder = prefix.replace('_', "-");
    if trimmed.is_empty() {
        format!("{folder}/{exp_name}")
    } else {
        format!("{trimmed}/{folder}/{exp_name}")
    }
}

fn scratch_dir(prefix: &str) -> Result<TempDir, CloudError> {
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir()
        .map_err(|err| CloudError::Scratch {
            path: format!("{prefix}*"),
            message: err.to_string(),
        })
}

/// Writes `contents` to `name` inside `dir` and returns the file's path.
fn write_scratch(dir: &TempDir, name: &str, contents: &str) -> Result<Utf8PathBuf, CloudError> {
    let root = Utf8Path::from_path(dir.path()).ok_or_else(|| CloudError::Scratch {
        path: dir.path().display().to_string(),
        message: String::from("path is not valid UTF-8"),
    })?;
    let path = root.join(name);
    write_ambient(&path, contents).map_err(|message| CloudError::Scratch {
        path: path.to_string(),
        message,
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests;
