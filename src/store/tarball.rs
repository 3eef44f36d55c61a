//! Deterministic, content-addressed gzip tarballs of directory trees.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::StoreError;
use crate::mount::FilterRules;

/// A tarball written to disk together with its content digest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tarball {
    /// Location of the `.tar.gz` file.
    pub path: Utf8PathBuf,
    /// Lowercase hex SHA-256 of the compressed bytes.
    pub digest: String,
}

impl Tarball {
    /// Object name used when the tarball is uploaded.
    #[must_use]
    pub fn object_name(&self) -> String {
        format!("{}.tar.gz", self.digest)
    }
}

/// Packs `source` into `<out_dir>/<digest>.tar.gz`, skipping filtered
/// entries at every depth.
///
/// Entries are added in sorted order with normalised metadata and a zero
/// gzip timestamp, so identical trees always hash identically.
///
/// # Errors
///
/// Returns [`StoreError::Archive`] when the tree cannot be read or the file
/// cannot be written.
pub fn write_tarball(
    source: &Utf8Path,
    filter: &FilterRules,
    out_dir: &Utf8Path,
) -> Result<Tarball, StoreError> {
    let bytes = pack_directory(source, filter).map_err(|message| StoreError::Archive {
        path: source.to_string(),
        message,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));
    let path = out_dir.join(format!("{digest}.tar.gz"));
    fs::write(&path, &bytes).map_err(|err| StoreError::Archive {
        path: path.to_string(),
        message: err.to_string(),
    })?;
    Ok(Tarball { path, digest })
}

/// Packs `source` into gzip-compressed tar bytes.
///
/// # Errors
///
/// Returns a rendered error message when the tree cannot be walked or read.
pub fn pack_directory(source: &Utf8Path, filter: &FilterRules) -> Result<Vec<u8>, String> {
    if !source.is_dir() {
        return Err(format!("source directory missing: {source}"));
    }

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !filter.matches(&entry.file_name().to_string_lossy()));
    for item in walker {
        let entry = item.map_err(|err| err.to_string())?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| err.to_string())?;
        if entry.file_type().is_dir() {
            builder
                .append_dir(relative, entry.path())
                .map_err(|err| format!("{}: {err}", relative.display()))?;
        } else {
            builder
                .append_path_with_name(entry.path(), relative)
                .map_err(|err| format!("{}: {err}", relative.display()))?;
        }
    }

    let mut encoder = builder.into_inner().map_err(|err| err.to_string())?;
    encoder.flush().map_err(|err| err.to_string())?;
    encoder.finish().map_err(|err| err.to_string())
}
