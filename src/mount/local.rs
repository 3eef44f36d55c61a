//! Host directories copied into, or written out of, the sandbox.

use std::fs;
use std::os::unix::fs::symlink;

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use super::{
    Direction, EXTRACT_SCRIPT, FilterRules, MountError, parent_or_current,
    reject_trailing_separator,
};
use crate::script::{ScriptBuilder, quote};
use crate::util::expand_tilde;

/// A host directory mount.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocalMount {
    source: Utf8PathBuf,
    name: String,
    mount_point: Utf8PathBuf,
    direction: Direction,
    add_to_search_path: bool,
    filter: FilterRules,
}

impl LocalMount {
    /// Creates a mount of `source` at `mount_point`.
    ///
    /// The source is resolved to an absolute path; the mount point defaults
    /// to it when omitted.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidMountPath`] when a writable mount point is
    /// relative or an explicit mount point ends with `/`.
    pub fn new(
        source: &str,
        mount_point: Option<&str>,
        direction: Direction,
    ) -> Result<Self, MountError> {
        let resolved = resolve_source(source)?;
        let mount_point = match mount_point {
            Some(explicit) => {
                let path = Utf8PathBuf::from(expand_tilde(explicit));
                reject_trailing_separator(&path)?;
                path
            }
            None => resolved.clone(),
        };
        if direction == Direction::Writable && !mount_point.is_absolute() {
            return Err(MountError::invalid_path(
                &mount_point,
                "writable mount points must be absolute",
            ));
        }

        Ok(Self {
            name: resolved.as_str().replace('/', "_"),
            source: resolved,
            mount_point,
            direction,
            add_to_search_path: false,
            filter: FilterRules::default(),
        })
    }

    /// Read-only mount of `source`.
    ///
    /// # Errors
    ///
    /// See [`LocalMount::new`].
    pub fn read_only(source: &str, mount_point: Option<&str>) -> Result<Self, MountError> {
        Self::new(source, mount_point, Direction::ReadOnly)
    }

    /// Writable output mount backed by `source` on the host.
    ///
    /// # Errors
    ///
    /// See [`LocalMount::new`].
    pub fn writable(source: &str, mount_point: Option<&str>) -> Result<Self, MountError> {
        Self::new(source, mount_point, Direction::Writable)
    }

    /// Appends the mount's parent directory to the search path.
    #[must_use]
    pub const fn with_search_path(mut self, enabled: bool) -> Self {
        self.add_to_search_path = enabled;
        self
    }

    /// Replaces the default exclusion rules.
    #[must_use]
    pub fn with_filter(mut self, filter: FilterRules) -> Self {
        self.filter = filter;
        self
    }

    /// Absolute host path.
    #[must_use]
    pub fn source(&self) -> &Utf8Path {
        &self.source
    }

    /// Source path with separators replaced by `_`.
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

    /// Exclusion rules applied while staging.
    #[must_use]
    pub const fn filter(&self) -> &FilterRules {
        &self.filter
    }

    /// Entries of `names` that staging would skip.
    #[must_use]
    pub fn ignore_patterns<'a>(&self, names: &[&'a str]) -> Vec<&'a str> {
        self.filter.ignore_patterns(names)
    }

    pub(super) fn search_path_entry(&self) -> Option<Utf8PathBuf> {
        self.add_to_search_path
            .then(|| parent_or_current(&self.mount_point).to_path_buf())
    }

    pub(super) fn stage(&self, staging: &Utf8Path) -> Result<(), MountError> {
        if self.direction == Direction::Writable {
            return Ok(());
        }
        if !self.source.is_dir() {
            return Err(MountError::staging(
                &self.source,
                "source directory does not exist",
            ));
        }
        if self.source.join(EXTRACT_SCRIPT).exists() {
            return Err(MountError::staging(
                &self.source,
                "top-level extract.sh is reserved for the extraction script",
            ));
        }
        copy_tree(&self.source, staging, &self.filter)
    }

    pub(super) fn extract_fragment(&self) -> ScriptBuilder {
        let mut script = ScriptBuilder::new();
        let parent = quote(parent_or_current(&self.mount_point).as_str());
        script.append("mkdir -p", [parent]);
        if self.direction == Direction::ReadOnly {
            let target = quote(self.mount_point.as_str());
            let staged = quote(&format!("./deps/local/{}", self.name));
            script.line(format!(
                "if [ -e {target} ]; then echo {} >&2; else mv {staged} {target} && rm -f {target}/{EXTRACT_SCRIPT}; fi",
                quote(&format!("{} already exists, leaving it in place", self.mount_point)),
            ));
        }
        script
    }
}

fn resolve_source(source: &str) -> Result<Utf8PathBuf, MountError> {
    let expanded = Utf8PathBuf::from(expand_tilde(source));
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        let raw_cwd = std::env::current_dir().map_err(|err| MountError::staging(source, err))?;
        let cwd = Utf8PathBuf::from_path_buf(raw_cwd)
            .map_err(|path| MountError::staging(path.display(), "non UTF-8 working directory"))?;
        cwd.join(expanded)
    };
    Ok(absolute.canonicalize_utf8().unwrap_or(absolute))
}

fn copy_tree(source: &Utf8Path, dest: &Utf8Path, filter: &FilterRules) -> Result<(), MountError> {
    fs::create_dir_all(dest).map_err(|err| MountError::staging(dest, err))?;
    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !filter.matches(&entry.file_name().to_string_lossy()));
    for item in walker {
        let entry = item.map_err(|err| MountError::staging(source, err))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| MountError::staging(entry.path().display(), err))?;
        let target = dest.as_std_path().join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| MountError::staging(target.display(), err))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .map_err(|err| MountError::staging(entry.path().display(), err))?;
            symlink(link, &target).map_err(|err| MountError::staging(target.display(), err))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|err| MountError::staging(target.display(), err))?;
        }
    }
    Ok(())
}
