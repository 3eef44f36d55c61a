//! Explicit credential values handed to backend constructors.
//!
//! Nothing in this module is global: callers resolve credentials once, from
//! the environment or the autoconfig file, and pass the values on.

use std::env;
use std::fmt;

use thiserror::Error;

use crate::util::expand_tilde;

mod autoconfig;

pub use autoconfig::Autoconfig;

/// Environment variable naming the default SSH identity file.
pub const SSH_IDENTITY_ENV: &str = "SATCHEL_SSH_IDENTITY";

/// Errors raised while resolving credentials.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CredentialsError {
    /// An SSH destination was not of the form `user@host`.
    #[error("invalid SSH destination '{value}': expected user@host")]
    InvalidDestination {
        /// Rejected input.
        value: String,
    },
    /// The autoconfig file could not be read or parsed.
    #[error("failed to load autoconfig {path}: {message}")]
    Autoconfig {
        /// Path of the file.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// A per-region autoconfig table has no entry for the region.
    #[error("autoconfig has no [{table}] entry for region {region}")]
    MissingRegion {
        /// Table that was consulted.
        table: &'static str,
        /// Region that was requested.
        region: String,
    },
}

/// Host, user and optional identity file for SSH access.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshCredentials {
    /// Remote host name or address.
    pub hostname: String,
    /// Remote user.
    pub username: String,
    /// Private key passed with `-i`, tilde-expanded.
    pub identity_file: Option<String>,
}

impl SshCredentials {
    /// Credentials without an identity file.
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            identity_file: None,
        }
    }

    /// Sets the identity file, ignoring blank values.
    #[must_use]
    pub fn with_identity_file(mut self, identity_file: Option<&str>) -> Self {
        self.identity_file = identity_file
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(expand_tilde);
        self
    }

    /// Parses `user@host` and takes the identity file from
    /// [`SSH_IDENTITY_ENV`] when set.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::InvalidDestination`] for malformed input.
    pub fn from_environment(destination: &str) -> Result<Self, CredentialsError> {
        let identity = env::var(SSH_IDENTITY_ENV).ok();
        Ok(Self::parse_destination(destination)?.with_identity_file(identity.as_deref()))
    }

    /// Parses `user@host` without consulting the environment.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::InvalidDestination`] when either side of
    /// the `@` is empty or missing.
    pub fn parse_destination(destination: &str) -> Result<Self, CredentialsError> {
        match destination.trim().split_once('@') {
            Some((user, host)) if !user.is_empty() && !host.is_empty() && !host.contains('@') => {
                Ok(Self::new(host, user))
            }
            _ => Err(CredentialsError::InvalidDestination {
                value: destination.to_owned(),
            }),
        }
    }

    /// `user@host` as used by `ssh` and `scp`.
    #[must_use]
    pub fn user_host(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

/// AWS access key pair.
#[derive(Clone, Eq, PartialEq)]
pub struct AwsCredentials {
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl AwsCredentials {
    /// Creates a key pair.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Variables the `aws` CLI reads its credentials from.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (String::from("AWS_ACCESS_KEY_ID"), self.access_key.clone()),
            (String::from("AWS_SECRET_ACCESS_KEY"), self.secret_key.clone()),
        ]
    }
}

/// GCP project and optional service-account key file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GcpCredentials {
    /// Project instances are created in.
    pub project: String,
    /// Service-account JSON key; `gcloud`'s active account is used when unset.
    pub key_file: Option<String>,
}

impl GcpCredentials {
    /// Credentials for `project` using the active `gcloud` account.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            key_file: None,
        }
    }

    /// Uses a service-account key file.
    #[must_use]
    pub fn with_key_file(mut self, key_file: impl Into<String>) -> Self {
        self.key_file = Some(expand_tilde(&key_file.into()));
        self
    }

    /// Variables `gcloud` and `gsutil` read their project and key from.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        let mut vars = vec![(String::from("CLOUDSDK_CORE_PROJECT"), self.project.clone())];
        if let Some(key_file) = &self.key_file {
            vars.push((String::from("GOOGLE_APPLICATION_CREDENTIALS"), key_file.clone()));
        }
        vars
    }
}
