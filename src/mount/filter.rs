//! Name-based exclusion rules applied while staging and tarring sources.

/// Extensions skipped by default when staging a directory.
pub const DEFAULT_FILTER_EXTENSIONS: [&str; 4] = [".pyc", ".log", ".git", ".mp4"];

/// Directory names skipped by default when staging a directory.
pub const DEFAULT_FILTER_DIRECTORIES: [&str; 2] = ["data", ".git"];

/// Exclusion rules matched against single path components.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilterRules {
    /// An entry is excluded when its name ends with any of these suffixes.
    pub extensions: Vec<String>,
    /// An entry is excluded when its name equals any of these.
    pub directories: Vec<String>,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_FILTER_EXTENSIONS.map(String::from).to_vec(),
            directories: DEFAULT_FILTER_DIRECTORIES.map(String::from).to_vec(),
        }
    }
}

impl FilterRules {
    /// Rules that exclude nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            extensions: Vec::new(),
            directories: Vec::new(),
        }
    }

    /// Returns `true` when an entry called `name` should be skipped.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
            || self.directories.iter().any(|dir| name == dir)
    }

    /// Returns exactly the entries of `names` that these rules exclude,
    /// preserving their order.
    #[must_use]
    pub fn ignore_patterns<'a>(&self, names: &[&'a str]) -> Vec<&'a str> {
        names
            .iter()
            .copied()
            .filter(|name| self.matches(name))
            .collect()
    }
}
