//! File watch configuration
//!
//! A file watch is the shared watch-path block (directory plus either an exact
//! file name or a regular expression) extended with the filesystem operation
//! to react to. The block is parsed once when the adapter is built.
//!
//! ```yaml
//! directory: /var/spool/uploads
//! pathRegexp: '.*\.csv$'
//! type: create
//! pollInterval: 500ms
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;

/// Directory and file selection shared by path-based sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchPathConfig {
    /// Directory to watch
    #[serde(default)]
    pub directory: String,
    /// Exact file name within the directory
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Regular expression matched against file names within the directory
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_regexp: String,
}

impl WatchPathConfig {
    /// Validate that the directory is set and exactly one selector is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directory.trim().is_empty() {
            return Err(ConfigError::missing("file.directory"));
        }
        match (self.path.is_empty(), self.path_regexp.is_empty()) {
            (true, true) => Err(ConfigError::missing("file.path or file.pathRegexp")),
            (false, false) => Err(ConfigError::invalid(
                "file.path",
                "path and pathRegexp are mutually exclusive",
            )),
            (true, false) => Regex::new(&self.path_regexp).map(|_| ()).map_err(|e| {
                ConfigError::invalid("file.pathRegexp", e.to_string())
            }),
            (false, true) => Ok(()),
        }
    }

    /// Compile the file selector
    pub fn matcher(&self) -> Result<PathMatcher, ConfigError> {
        if !self.path_regexp.is_empty() {
            let regex = Regex::new(&self.path_regexp)
                .map_err(|e| ConfigError::invalid("file.pathRegexp", e.to_string()))?;
            Ok(PathMatcher::Pattern(regex))
        } else if !self.path.is_empty() {
            Ok(PathMatcher::Exact(self.path.clone()))
        } else {
            Err(ConfigError::missing("file.path or file.pathRegexp"))
        }
    }
}

/// Compiled file selector
#[derive(Debug, Clone)]
pub enum PathMatcher {
    /// Match one file name exactly
    Exact(String),
    /// Match file names against a regular expression
    Pattern(Regex),
}

impl PathMatcher {
    /// Whether a file name (not a full path) is selected
    pub fn matches(&self, file_name: &str) -> bool {
        match self {
            PathMatcher::Exact(name) => name == file_name,
            PathMatcher::Pattern(regex) => regex.is_match(file_name),
        }
    }
}

/// Filesystem operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FileOperation {
    /// File appeared
    Create,
    /// File contents changed
    Write,
    /// File disappeared
    Remove,
    /// File moved to another name
    Rename,
    /// File permissions changed
    Chmod,
}

impl FileOperation {
    /// Lowercase name used in configuration and event bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            FileOperation::Create => "create",
            FileOperation::Write => "write",
            FileOperation::Remove => "remove",
            FileOperation::Rename => "rename",
            FileOperation::Chmod => "chmod",
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileOperation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(FileOperation::Create),
            "write" => Ok(FileOperation::Write),
            "remove" => Ok(FileOperation::Remove),
            "rename" => Ok(FileOperation::Rename),
            "chmod" => Ok(FileOperation::Chmod),
            other => Err(ConfigError::invalid(
                "file.type",
                format!("unknown file operation {other:?}"),
            )),
        }
    }
}

impl TryFrom<String> for FileOperation {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FileOperation> for String {
    fn from(op: FileOperation) -> Self {
        op.as_str().to_string()
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

/// Watch configuration for the file adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWatchConfig {
    /// Directory and file selection
    #[serde(flatten)]
    pub watch_path: WatchPathConfig,

    /// Operation to react to
    #[serde(rename = "type")]
    pub op: FileOperation,

    /// How often the directory is scanned
    #[serde(default = "default_poll_interval", with = "crate::duration")]
    pub poll_interval: Duration,

    /// Metadata copied into every event
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FileWatchConfig {
    /// Parse and validate a YAML watch block
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FileWatchConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate watch path settings and the poll interval
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.watch_path.validate()?;
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                "file.pollInterval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
