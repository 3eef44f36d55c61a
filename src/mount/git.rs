//! Git repositories cloned inside the sandbox at extraction time.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use super::{MountError, parent_or_current, reject_trailing_separator};
use crate::script::{ScriptBuilder, quote};
use crate::util::expand_tilde;

/// File name the SSH identity is copied to inside the staging directory.
const IDENTITY_FILE: &str = "ssh_identity";

/// A git repository mount. Cloning needs network access from the sandbox.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GitMount {
    url: String,
    repo_name: String,
    mount_point: Utf8PathBuf,
    branch: Option<String>,
    identity_file: Option<Utf8PathBuf>,
    add_to_search_path: bool,
}

impl GitMount {
    /// Creates a mount cloning `url` into `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidMountPath`] when the URL has no
    /// repository name, or the mount point does not end with it.
    pub fn new(url: &str, mount_point: &str) -> Result<Self, MountError> {
        let repo_name = repository_name(url)
            .ok_or_else(|| MountError::invalid_path(url, "cannot derive a repository name"))?;
        let mount = Utf8PathBuf::from(expand_tilde(mount_point));
        reject_trailing_separator(&mount)?;
        if mount.file_name() != Some(repo_name.as_str()) {
            return Err(MountError::invalid_path(
                &mount,
                &format!("git mount points must end with the repository name {repo_name}"),
            ));
        }

        Ok(Self {
            url: url.to_owned(),
            repo_name,
            mount_point: mount,
            branch: None,
            identity_file: None,
            add_to_search_path: false,
        })
    }

    /// Checks out `branch` after cloning.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Clones over SSH with `identity_file`, which is copied into the bundle.
    #[must_use]
    pub fn with_identity_file(mut self, identity_file: &str) -> Self {
        self.identity_file = Some(Utf8PathBuf::from(expand_tilde(identity_file)));
        self
    }

    /// Appends the clone directory to the search path.
    #[must_use]
    pub const fn with_search_path(mut self, enabled: bool) -> Self {
        self.add_to_search_path = enabled;
        self
    }

    /// Repository URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Repository name; doubles as the mount name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.repo_name
    }

    /// Sandbox path of the clone.
    #[must_use]
    pub fn mount_point(&self) -> &Utf8Path {
        &self.mount_point
    }

    pub(super) fn search_path_entry(&self) -> Option<Utf8PathBuf> {
        self.add_to_search_path.then(|| self.mount_point.clone())
    }

    pub(super) fn stage(&self, staging: &Utf8Path) -> Result<(), MountError> {
        fs::create_dir_all(staging).map_err(|err| MountError::staging(staging, err))?;
        if let Some(identity) = &self.identity_file {
            fs::copy(identity, staging.join(IDENTITY_FILE))
                .map_err(|err| MountError::staging(identity, err))?;
        }
        Ok(())
    }

    pub(super) fn extract_fragment(&self) -> ScriptBuilder {
        let mut script = ScriptBuilder::new();
        let url = quote(&self.url);
        let target = quote(&self.repo_name);
        if self.identity_file.is_some() {
            script.line(format!(
                "SATCHEL_GIT_IDENTITY=\"$(pwd)\"/{}",
                quote(&format!("deps/git/{}/{IDENTITY_FILE}", self.repo_name))
            ));
            script.line("chmod 600 \"$SATCHEL_GIT_IDENTITY\"");
        }
        script.append("mkdir -p", [quote(parent_or_current(&self.mount_point).as_str())]);
        script.append("cd", [quote(parent_or_current(&self.mount_point).as_str())]);
        let mut clone = if self.identity_file.is_some() {
            format!(
                "GIT_SSH_COMMAND=\"ssh -o StrictHostKeyChecking=no -i \\\"$SATCHEL_GIT_IDENTITY\\\"\" git clone --quiet {url} {target}"
            )
        } else {
            format!("git clone --quiet {url} {target}")
        };
        if let Some(branch) = &self.branch {
            clone.push_str(&format!(
                " && (cd {target} && git checkout --quiet {})",
                quote(branch)
            ));
        }
        script.line(format!(
            "if [ -e {target} ]; then echo {} >&2; else {clone}; fi",
            quote(&format!("{} already exists, leaving it in place", self.mount_point)),
        ));
        script
    }
}

/// Last path component of a repository URL without its extension.
fn repository_name(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    (!name.is_empty()).then(|| name.to_owned())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::repository_name;

    #[rstest]
    #[case("https://github.com/org/project.git", Some("project"))]
    #[case("git@github.com:org/project.git", Some("project"))]
    #[case("git@host:project", Some("project"))]
    #[case("/srv/repos/tools/", Some("tools"))]
    #[case("https://host/", Some("host"))]
    #[case("", None)]
    fn repository_name_strips_path_and_extension(
        #[case] url: &str,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(repository_name(url).as_deref(), expected);
    }
}
