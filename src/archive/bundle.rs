//! Executing a compiled bundle and extracting its payload output.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8Path;

use super::ArchiveError;
use super::output::strip_banner;
use crate::process::{ProcessLauncher, ProcessOutcome, ProcessSpec};

/// Output of a synchronous bundle run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleRun {
    /// Payload stdout with the extraction banner removed.
    pub output: String,
    /// Exit code of the bundle, absent when killed by a signal.
    pub exit_code: Option<i32>,
}

/// Command executing `bundle` with `interpreter`, forwarding `cli_args` to
/// the payload.
#[must_use]
pub fn bundle_invocation(interpreter: &str, bundle: &Utf8Path, cli_args: &[String]) -> ProcessSpec {
    ProcessSpec::new(interpreter)
        .args([
            OsString::from(bundle.as_str()),
            OsString::from("--quiet"),
            OsString::from("--"),
        ])
        .args(cli_args.iter().map(OsString::from))
}

/// Runs `bundle`, capturing stdout and returning everything after the
/// sentinel.
///
/// # Errors
///
/// Returns [`ArchiveError::Process`] when the bundle cannot be started, times
/// out or is interrupted, and [`ArchiveError::SentinelMissing`] when the
/// payload never started.
pub async fn run_bundle(
    launcher: &dyn ProcessLauncher,
    interpreter: &str,
    bundle: &Utf8Path,
    cli_args: &[String],
    timeout: Option<Duration>,
) -> Result<BundleRun, ArchiveError> {
    let spec = bundle_invocation(interpreter, bundle, cli_args)
        .capture_output(true)
        .timeout(timeout);
    match launcher.launch(&spec).await? {
        ProcessOutcome::Exited { code, stdout, .. } => {
            let output = strip_banner(&stdout)
                .map_err(|_| ArchiveError::SentinelMissing { exit_code: code })?;
            Ok(BundleRun {
                output: output.to_owned(),
                exit_code: code,
            })
        }
        ProcessOutcome::Detached { .. } => Err(ArchiveError::Build {
            message: String::from("bundle detached while output capture was requested"),
        }),
    }
}
