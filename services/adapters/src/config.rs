//! Configuration module for adapters
//!
//! Runtime settings shared by all adapter instances come from the environment;
//! per-instance settings come from a descriptor file, optionally patched by
//! environment overrides after load.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use types::{ConfigError, EventSourceDescriptor, SourceConfig};

use crate::secrets::DEFAULT_SECRETS_MOUNT;

/// Runtime settings shared by all adapters in a process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Directory holding mounted secrets
    pub secrets_mount: PathBuf,

    /// Upper bound for the best-effort unsubscribe during shutdown
    #[serde(with = "types::duration")]
    pub unsubscribe_timeout: Duration,

    /// Optional per-message dispatch timeout; unset means dispatch may take as long as it needs
    #[serde(default, with = "types::duration::option")]
    pub dispatch_timeout: Option<Duration>,

    /// Timeout for a single connection attempt
    #[serde(with = "types::duration")]
    pub connect_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            secrets_mount: PathBuf::from(DEFAULT_SECRETS_MOUNT),
            unsubscribe_timeout: Duration::from_secs(5),
            dispatch_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl AdapterConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            secrets_mount: env::var("EVENTSOURCE_SECRETS_MOUNT")
                .map(PathBuf::from)
                .unwrap_or(defaults.secrets_mount),

            unsubscribe_timeout: env_duration("EVENTSOURCE_UNSUBSCRIBE_TIMEOUT")
                .unwrap_or(defaults.unsubscribe_timeout),

            dispatch_timeout: env_duration("EVENTSOURCE_DISPATCH_TIMEOUT"),

            connect_timeout: env_duration("EVENTSOURCE_CONNECT_TIMEOUT")
                .unwrap_or(defaults.connect_timeout),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unsubscribe_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "unsubscribeTimeout",
                "must be greater than zero",
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("connectTimeout", "must be greater than zero"));
        }
        if matches!(self.dispatch_timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::invalid("dispatchTimeout", "must be greater than zero"));
        }
        Ok(())
    }
}

fn env_duration(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|s| types::duration::parse(&s).ok())
}

/// Read a descriptor file and apply environment overrides
pub fn load_descriptor(path: &Path) -> Result<EventSourceDescriptor, ConfigError> {
    let mut descriptor = EventSourceDescriptor::from_file(path)?;
    apply_env_overrides(&mut descriptor, |key| env::var(key).ok())?;
    info!(
        path = %path.display(),
        event_source_name = %descriptor.event_source_name,
        event_name = %descriptor.event_name,
        event_source_type = %descriptor.source_type(),
        "loaded event source descriptor"
    );
    Ok(descriptor)
}

/// Override descriptor fields from the environment
///
/// `lookup` is `std::env::var` in production. Overrides are validated the same
/// way as file contents.
pub fn apply_env_overrides<F>(
    descriptor: &mut EventSourceDescriptor,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match &mut descriptor.source {
        SourceConfig::Broker(broker) => {
            if let Some(address) = lookup("EVENTSOURCE_BROKER") {
                broker.broker = address;
            }
            if let Some(channel) = lookup("EVENTSOURCE_CHANNEL_NAME") {
                broker.channel_name = channel;
            }
            if let Some(key) = lookup("EVENTSOURCE_CHANNEL_KEY") {
                broker.channel_key = key;
            }
            broker.validate()
        }
        SourceConfig::File(file) => {
            if let Some(directory) = lookup("EVENTSOURCE_WATCH_DIRECTORY") {
                file.watch_path.directory = directory;
            }
            file.validate()
        }
    }
}
