//! Archive compilers turning a working tree into one executable file.

use std::ffi::OsString;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use super::ArchiveError;
use crate::mount::FilterRules;
use crate::runner::{CommandRunner, ProcessCommandRunner};
use crate::store::pack_directory;

/// Label embedded in every bundle.
pub const ARCHIVE_LABEL: &str = "SATCHEL";

/// Line separating the embedded header from the compressed payload.
pub const PAYLOAD_MARKER: &str = "# --- satchel payload below ---";

/// Inputs to an archive compiler.
#[derive(Clone, Copy, Debug)]
pub struct CompileRequest<'a> {
    /// Tree to pack.
    pub working_dir: &'a Utf8Path,
    /// File to produce.
    pub output: &'a Utf8Path,
    /// Human readable label.
    pub label: &'a str,
    /// Script inside `working_dir` to run after extraction.
    pub entry: &'a str,
}

/// Produces a self-extracting executable from a working tree.
pub trait ArchiveCompiler: Send + Sync {
    /// Compiles `request.working_dir` into `request.output`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Compile`] when the output was not produced.
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), ArchiveError>;
}

/// Compiler delegating to the external `makeself` tool.
#[derive(Clone, Debug)]
pub struct MakeselfCompiler<R: CommandRunner> {
    runner: R,
    makeself_bin: String,
    header: Option<Utf8PathBuf>,
}

impl MakeselfCompiler<ProcessCommandRunner> {
    /// Creates a compiler wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(makeself_bin: String, header: Option<Utf8PathBuf>) -> Self {
        Self::new(ProcessCommandRunner, makeself_bin, header)
    }
}

impl<R: CommandRunner> MakeselfCompiler<R> {
    /// Creates a compiler using `runner`, an executable path and an optional
    /// header template.
    #[must_use]
    pub const fn new(runner: R, makeself_bin: String, header: Option<Utf8PathBuf>) -> Self {
        Self {
            runner,
            makeself_bin,
            header,
        }
    }

    fn args(&self, request: &CompileRequest<'_>) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--nocrc"),
            OsString::from("--nomd5"),
            OsString::from("--quiet"),
        ];
        if let Some(header) = &self.header {
            args.push(OsString::from("--header"));
            args.push(OsString::from(header.as_str()));
        }
        args.extend([
            OsString::from(request.working_dir.as_str()),
            OsString::from(request.output.as_str()),
            OsString::from(request.label),
            OsString::from(format!("./{}", request.entry)),
        ]);
        args
    }
}

impl<R: CommandRunner> ArchiveCompiler for MakeselfCompiler<R> {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), ArchiveError> {
        self.runner
            .run_checked(&self.makeself_bin, &self.args(request))
            .map_err(|err| ArchiveError::Compile {
                message: err.to_string(),
            })?;
        if !request.output.is_file() {
            return Err(ArchiveError::Compile {
                message: format!("{} did not produce {}", self.makeself_bin, request.output),
            });
        }
        Ok(())
    }
}

/// Built-in compiler writing a POSIX shell header followed by a gzip tarball.
///
/// The header accepts the makeself-style `--quiet` and `--` flags so both
/// compilers' bundles are invoked the same way.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmbeddedCompiler;

impl EmbeddedCompiler {
    fn header(label: &str, entry: &str) -> String {
        let body = format!(
            r#"#!/bin/sh
# {label} self-extracting bundle
quiet=0
while [ $# -gt 0 ]; do
  case "$1" in
    --quiet|-q) quiet=1; shift ;;
    --) shift; break ;;
    *) break ;;
  esac
done
satchel_dir=$(mktemp -d "${{TMPDIR:-/tmp}}/satchel.XXXXXX") || exit 1
trap 'rm -rf "$satchel_dir"' EXIT
trap 'exit 130' INT
trap 'exit 143' TERM
[ "$quiet" -eq 1 ] || echo "Extracting {label} bundle"
tail -n +@SKIP@ "$0" | tar -xzf - -C "$satchel_dir" || exit 1
cd "$satchel_dir" || exit 1
/bin/sh ./{entry} "$@"
exit $?
{PAYLOAD_MARKER}
"#
        );
        let skip = body.lines().count() + 1;
        body.replace("@SKIP@", &skip.to_string())
    }
}

impl ArchiveCompiler for EmbeddedCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<(), ArchiveError> {
        let payload = pack_directory(request.working_dir, &FilterRules::none())
            .map_err(|message| ArchiveError::Compile { message })?;
        let mut bytes = Self::header(request.label, request.entry).into_bytes();
        bytes.extend_from_slice(&payload);
        fs::write(request.output, bytes).map_err(|err| ArchiveError::Compile {
            message: format!("{}: {err}", request.output),
        })
    }
}

/// Compressed payload of a bundle produced by [`EmbeddedCompiler`].
#[must_use]
pub fn embedded_payload(bundle: &[u8]) -> Option<&[u8]> {
    let marker = format!("{PAYLOAD_MARKER}\n");
    let needle = marker.as_bytes();
    let start = bundle
        .windows(needle.len())
        .position(|window| window == needle)?;
    bundle.get(start + needle.len()..)
}
