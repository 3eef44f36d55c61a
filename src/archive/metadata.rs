//! The `METADATA` file written into every bundle.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// Build metadata recorded as `key=value` lines.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Metadata {
    /// Version of the tool that built the bundle.
    pub version: String,
    /// Build time in seconds since the Unix epoch.
    pub unix_timestamp: u64,
    /// Random identifier of this build.
    pub build_id: Uuid,
}

impl Metadata {
    /// Metadata for a build happening now.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            unix_timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs()),
            build_id: Uuid::new_v4(),
        }
    }

    /// Renders the file contents.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "satchel_version={}\nunix_timestamp={}\nbuild_id={}\n",
            self.version, self.unix_timestamp, self.build_id
        )
    }

    /// Parses contents produced by [`Metadata::render`].
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut version = None;
        let mut unix_timestamp = None;
        let mut build_id = None;
        for line in text.lines() {
            match line.split_once('=') {
                Some(("satchel_version", value)) => version = Some(value.to_owned()),
                Some(("unix_timestamp", value)) => unix_timestamp = value.parse().ok(),
                Some(("build_id", value)) => build_id = Uuid::parse_str(value).ok(),
                _ => {}
            }
        }
        Some(Self {
            version: version?,
            unix_timestamp: unix_timestamp?,
            build_id: build_id?,
        })
    }
}
