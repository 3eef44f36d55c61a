//! Tool configuration loaded via `ortho-config`.
//!
//! [`SatchelConfig`] merges defaults, `satchel.toml` (or `.satchel.toml`, or
//! the file named by `SATCHEL_CONFIG_PATH`) and `SATCHEL_*` environment
//! variables. Cloud account details live in the separate autoconfig file, see
//! [`crate::credentials::Autoconfig`].

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::archive::{
    ArchiveBuilder, ArchiveCompiler, DEFAULT_SEARCH_PATH_VAR, EmbeddedCompiler, MakeselfCompiler,
};
use crate::process::DEFAULT_GRACE_PERIOD;
use crate::util::expand_tilde;

/// Default autoconfig location.
pub const DEFAULT_AUTOCONFIG_PATH: &str = "~/.config/satchel/autoconfig.toml";

/// Which archive compiler to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompilerKind {
    /// Built-in shell header plus gzip tarball.
    Embedded,
    /// External `makeself`.
    Makeself,
}

/// Settings shared by every command, loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SATCHEL",
    discovery(
        app_name = "satchel",
        env_var = "SATCHEL_CONFIG_PATH",
        config_file_name = "satchel.toml",
        dotfile_name = ".satchel.toml",
        project_file_name = "satchel.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "SSH toggles are naturally expressed as booleans"
)]
pub struct SatchelConfig {
    /// Interpreter that runs bundles.
    #[ortho_config(default = "sh".to_owned())]
    pub shell_interpreter: String,
    /// Archive compiler: `embedded` or `makeself`.
    #[ortho_config(default = "embedded".to_owned())]
    pub compiler: String,
    /// Path to the `makeself` executable.
    #[ortho_config(default = "makeself".to_owned())]
    pub makeself_bin: String,
    /// Optional makeself header template.
    pub makeself_header: Option<String>,
    /// Variable extended by search-path mounts.
    #[ortho_config(default = DEFAULT_SEARCH_PATH_VAR.to_owned())]
    pub search_path_var: String,
    /// Path to the `docker` executable.
    #[ortho_config(default = "docker".to_owned())]
    pub docker_bin: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override; `/dev/null` suits ephemeral hosts.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Path to the `aws` executable.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Path to the `gcloud` executable.
    #[ortho_config(default = "gcloud".to_owned())]
    pub gcloud_bin: String,
    /// Path to the `gsutil` executable.
    #[ortho_config(default = "gsutil".to_owned())]
    pub gsutil_bin: String,
    /// Cloud autoconfig file.
    #[ortho_config(default = DEFAULT_AUTOCONFIG_PATH.to_owned())]
    pub autoconfig_path: String,
    /// Seconds a terminated process group gets before `SIGKILL`.
    #[ortho_config(default = 5)]
    pub grace_period_secs: u64,
}

/// Errors raised while loading or validating [`SatchelConfig`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Merging configuration layers failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A required value is empty.
    #[error("missing {field}: set SATCHEL_{env_suffix} or add {field} to satchel.toml", env_suffix = field.to_uppercase())]
    MissingField {
        /// Field that failed validation.
        field: String,
    },
    /// A value is present but not one of the accepted options.
    #[error("invalid {field} '{value}': expected {expected}")]
    InvalidValue {
        /// Field that failed validation.
        field: String,
        /// Rejected value.
        value: String,
        /// Accepted values.
        expected: &'static str,
    },
}

impl Default for SatchelConfig {
    fn default() -> Self {
        Self {
            shell_interpreter: String::from("sh"),
            compiler: String::from("embedded"),
            makeself_bin: String::from("makeself"),
            makeself_header: None,
            search_path_var: DEFAULT_SEARCH_PATH_VAR.to_owned(),
            docker_bin: String::from("docker"),
            ssh_bin: String::from("ssh"),
            scp_bin: String::from("scp"),
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            aws_bin: String::from("aws"),
            gcloud_bin: String::from("gcloud"),
            gsutil_bin: String::from("gsutil"),
            autoconfig_path: DEFAULT_AUTOCONFIG_PATH.to_owned(),
            grace_period_secs: DEFAULT_GRACE_PERIOD.as_secs(),
        }
    }
}

impl SatchelConfig {
    /// Loads configuration from defaults, files and environment variables
    /// without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("satchel")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures every executable and name is present and the compiler choice
    /// is known.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty values and
    /// [`ConfigError::InvalidValue`] for an unknown compiler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, field) in [
            (&self.shell_interpreter, "shell_interpreter"),
            (&self.makeself_bin, "makeself_bin"),
            (&self.search_path_var, "search_path_var"),
            (&self.docker_bin, "docker_bin"),
            (&self.ssh_bin, "ssh_bin"),
            (&self.scp_bin, "scp_bin"),
            (&self.aws_bin, "aws_bin"),
            (&self.gcloud_bin, "gcloud_bin"),
            (&self.gsutil_bin, "gsutil_bin"),
        ] {
            Self::require_value(value, field)?;
        }
        if let Some(header) = &self.makeself_header {
            Self::require_value(header, "makeself_header")?;
        }
        self.compiler_kind().map(|_| ())
    }

    /// Parsed compiler choice.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for anything other than
    /// `embedded` or `makeself`.
    pub fn compiler_kind(&self) -> Result<CompilerKind, ConfigError> {
        match self.compiler.trim() {
            "embedded" => Ok(CompilerKind::Embedded),
            "makeself" => Ok(CompilerKind::Makeself),
            other => Err(ConfigError::InvalidValue {
                field: String::from("compiler"),
                value: other.to_owned(),
                expected: "embedded or makeself",
            }),
        }
    }

    /// Archive builder wired to the configured compiler and search path.
    ///
    /// # Errors
    ///
    /// Propagates [`SatchelConfig::compiler_kind`] failures.
    pub fn archive_builder(&self) -> Result<ArchiveBuilder, ConfigError> {
        let compiler: Box<dyn ArchiveCompiler> = match self.compiler_kind()? {
            CompilerKind::Embedded => Box::new(EmbeddedCompiler),
            CompilerKind::Makeself => Box::new(MakeselfCompiler::with_process_runner(
                expand_tilde(&self.makeself_bin),
                self.makeself_header
                    .as_deref()
                    .map(|header| Utf8PathBuf::from(expand_tilde(header))),
            )),
        };
        Ok(ArchiveBuilder::from_boxed(compiler).with_search_path_var(&self.search_path_var))
    }

    /// Termination grace period for process groups.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Tilde-expanded autoconfig path.
    #[must_use]
    pub fn autoconfig_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.autoconfig_path))
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
