//! The cloud autoconfig file.
//!
//! ```toml
//! [default]
//! s3_bucket_name = "my-bucket"
//! iam_instance_profile_name = "satchel"
//! aws_security_groups = ["satchel-sg"]
//! aws_access_key = "AKIA..."
//! aws_access_secret = "..."
//!
//! [aws_image_ids]
//! us-west-1 = "ami-0123"
//!
//! [aws_key_names]
//! us-west-1 = "satchel-us-west-1"
//! ```

use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Deserialize;

use super::{AwsCredentials, CredentialsError};
use crate::util::{expand_tilde, read_to_string_ambient};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
struct DefaultSection {
    s3_bucket_name: String,
    #[serde(default = "default_iam_profile")]
    iam_instance_profile_name: String,
    #[serde(default)]
    aws_security_groups: Vec<String>,
    aws_access_key: String,
    aws_access_secret: String,
}

fn default_iam_profile() -> String {
    String::from("satchel")
}

/// Parsed autoconfig file feeding the cloud backends.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Autoconfig {
    default: DefaultSection,
    #[serde(default)]
    aws_image_ids: BTreeMap<String, String>,
    #[serde(default)]
    aws_key_names: BTreeMap<String, String>,
    #[serde(default)]
    aws_security_group_ids: BTreeMap<String, Vec<String>>,
}

impl Autoconfig {
    /// Reads and parses the file at `path` (tilde-expanded).
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::Autoconfig`] when the file cannot be read
    /// or is not valid TOML of the expected shape.
    pub fn load(path: &Utf8Path) -> Result<Self, CredentialsError> {
        let expanded = expand_tilde(path.as_str());
        let text = read_to_string_ambient(Utf8Path::new(&expanded)).map_err(|message| {
            CredentialsError::Autoconfig {
                path: expanded.clone(),
                message,
            }
        })?;
        Self::parse(&text).map_err(|err| match err {
            CredentialsError::Autoconfig { message, .. } => CredentialsError::Autoconfig {
                path: expanded,
                message,
            },
            other => other,
        })
    }

    /// Parses autoconfig TOML.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::Autoconfig`] on malformed input.
    pub fn parse(text: &str) -> Result<Self, CredentialsError> {
        toml::from_str(text).map_err(|err| CredentialsError::Autoconfig {
            path: String::from("<inline>"),
            message: err.to_string(),
        })
    }

    /// Bucket used for bundles, logs and outputs.
    #[must_use]
    pub fn s3_bucket(&self) -> &str {
        &self.default.s3_bucket_name
    }

    /// IAM instance profile attached to spot instances.
    #[must_use]
    pub fn iam_profile_name(&self) -> &str {
        &self.default.iam_instance_profile_name
    }

    /// Security group names.
    #[must_use]
    pub fn security_groups(&self) -> &[String] {
        &self.default.aws_security_groups
    }

    /// Security group ids for `region`; empty when not configured.
    #[must_use]
    pub fn security_group_ids(&self, region: &str) -> &[String] {
        self.aws_security_group_ids
            .get(region)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Access key pair.
    #[must_use]
    pub fn credentials(&self) -> AwsCredentials {
        AwsCredentials::new(&self.default.aws_access_key, &self.default.aws_access_secret)
    }

    /// Image id for `region`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::MissingRegion`] when absent.
    pub fn image_id(&self, region: &str) -> Result<&str, CredentialsError> {
        lookup(&self.aws_image_ids, "aws_image_ids", region)
    }

    /// Key pair name for `region`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialsError::MissingRegion`] when absent.
    pub fn key_name(&self, region: &str) -> Result<&str, CredentialsError> {
        lookup(&self.aws_key_names, "aws_key_names", region)
    }
}

fn lookup<'a>(
    table: &'a BTreeMap<String, String>,
    name: &'static str,
    region: &str,
) -> Result<&'a str, CredentialsError> {
    table
        .get(region)
        .map(String::as_str)
        .ok_or_else(|| CredentialsError::MissingRegion {
            table: name,
            region: region.to_owned(),
        })
}
