//! Event source descriptors
//!
//! A descriptor identifies one adapter instance: which event source it belongs
//! to, which event it produces, what kind of source it talks to, and the
//! source-specific settings. Descriptors are validated once at load time and
//! never change afterwards.
//!
//! ```yaml
//! eventSourceName: orders
//! eventName: order-created
//! broker:
//!   broker: ws://emitter.local:8080
//!   channelKey: "k3y"
//!   channelName: orders/
//!   jsonBody: true
//!   metadata:
//!     team: checkout
//!   connectionBackoff:
//!     duration: 1s
//!     factor: 2
//!     steps: 5
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::watch::FileWatchConfig;

/// Kind of external system an adapter listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSourceType {
    /// Publish/subscribe broker channel
    Broker,
    /// Filesystem watch
    File,
}

impl fmt::Display for EventSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSourceType::Broker => write!(f, "broker"),
            EventSourceType::File => write!(f, "file"),
        }
    }
}

/// Reference to a secret held by the secret-retrieval collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Secret name (directory under the secrets mount)
    pub name: String,
    /// Key within the secret (file under the secret directory)
    pub key: String,
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.key)
    }
}

/// TLS material references for a transport connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// PEM-encoded CA certificate used to verify the remote end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_secret: Option<SecretRef>,
    /// PEM-encoded client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_secret: Option<SecretRef>,
    /// PEM-encoded PKCS#8 client key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_secret: Option<SecretRef>,
    /// Skip certificate verification (development only)
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.client_cert_secret.is_some() != self.client_key_secret.is_some() {
            return Err(ConfigError::invalid(
                "tls",
                "clientCertSecret and clientKeySecret must be provided together",
            ));
        }
        Ok(())
    }
}

/// Retry parameters for establishing a connection
///
/// The delay before retry `n` (zero-based) is `duration * factor^n`, capped
/// at `cap` when set, plus up to `jitter * delay` of random slack. After
/// `steps` failed attempts the connection attempt is abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionBackoffPolicy {
    /// Initial delay between attempts
    #[serde(with = "crate::duration")]
    pub duration: Duration,
    /// Multiplier applied to the delay after each failure
    pub factor: f64,
    /// Random slack as a fraction of the delay, `0.0..=1.0`
    pub jitter: f64,
    /// Total number of attempts before giving up
    pub steps: u32,
    /// Upper bound for a single delay
    #[serde(
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub cap: Option<Duration>,
}

impl Default for ConnectionBackoffPolicy {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
            factor: 1.5,
            jitter: 0.0,
            steps: 5,
            cap: None,
        }
    }
}

impl ConnectionBackoffPolicy {
    /// Validate retry parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps == 0 {
            return Err(ConfigError::invalid(
                "connectionBackoff.steps",
                "must allow at least one attempt",
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(ConfigError::invalid(
                "connectionBackoff.factor",
                format!("must be >= 1.0, got {}", self.factor),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "connectionBackoff.jitter",
                format!("must be within 0.0..=1.0, got {}", self.jitter),
            ));
        }
        Ok(())
    }

    /// Base delay (without jitter) after the `retry`-th failed attempt, zero-based
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.duration.as_nanos() as f64 * self.factor.powi(exponent);
        let mut delay = crate::duration::from_nanos_f64(scaled);
        if let Some(cap) = self.cap {
            delay = delay.min(cap);
        }
        delay
    }

    /// Sum of all base delays a caller may wait through before the final error
    pub fn total_delay(&self) -> Duration {
        (0..self.steps.saturating_sub(1))
            .map(|retry| self.delay(retry))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}

/// Settings for a publish/subscribe broker channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEventSource {
    /// Broker address, e.g. `ws://broker:8080`
    pub broker: String,
    /// Access key for the channel
    pub channel_key: String,
    /// Channel to subscribe to
    pub channel_name: String,
    /// Username secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<SecretRef>,
    /// Password secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretRef>,
    /// TLS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    /// Treat every payload as JSON and embed it structurally in the envelope
    #[serde(default)]
    pub json_body: bool,
    /// Metadata copied into every event
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Retry policy for the initial connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_backoff: Option<ConnectionBackoffPolicy>,
}

impl BrokerEventSource {
    /// Validate required fields and nested settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.trim().is_empty() {
            return Err(ConfigError::missing("broker.broker"));
        }
        if self.channel_key.trim().is_empty() {
            return Err(ConfigError::missing("broker.channelKey"));
        }
        if self.channel_name.trim().is_empty() {
            return Err(ConfigError::missing("broker.channelName"));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        if let Some(backoff) = &self.connection_backoff {
            backoff.validate()?;
        }
        Ok(())
    }

    /// Effective backoff policy
    pub fn backoff(&self) -> ConnectionBackoffPolicy {
        self.connection_backoff.clone().unwrap_or_default()
    }
}

/// Source-specific part of a descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    /// Broker channel subscription
    Broker(BrokerEventSource),
    /// Filesystem watch
    File(FileWatchConfig),
}

/// Immutable, validated configuration for one adapter instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DescriptorDocument", into = "DescriptorDocument")]
pub struct EventSourceDescriptor {
    /// Name of the event source this adapter belongs to
    pub event_source_name: String,
    /// Name of the event this adapter produces
    pub event_name: String,
    /// Source-specific settings
    pub source: SourceConfig,
}

/// On-disk shape of a descriptor: one optional block per source type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescriptorDocument {
    #[serde(default)]
    event_source_name: String,
    #[serde(default)]
    event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    broker: Option<BrokerEventSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<FileWatchConfig>,
}

impl TryFrom<DescriptorDocument> for EventSourceDescriptor {
    type Error = ConfigError;

    fn try_from(doc: DescriptorDocument) -> Result<Self, Self::Error> {
        if doc.event_source_name.trim().is_empty() {
            return Err(ConfigError::missing("eventSourceName"));
        }
        if doc.event_name.trim().is_empty() {
            return Err(ConfigError::missing("eventName"));
        }

        let source = match (doc.broker, doc.file) {
            (Some(broker), None) => {
                broker.validate()?;
                SourceConfig::Broker(broker)
            }
            (None, Some(file)) => {
                file.validate()?;
                SourceConfig::File(file)
            }
            (None, None) => {
                return Err(ConfigError::invalid(
                    "source",
                    "one of `broker` or `file` must be configured",
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ConfigError::invalid(
                    "source",
                    "only one of `broker` or `file` may be configured",
                ))
            }
        };

        Ok(Self {
            event_source_name: doc.event_source_name,
            event_name: doc.event_name,
            source,
        })
    }
}

impl From<EventSourceDescriptor> for DescriptorDocument {
    fn from(descriptor: EventSourceDescriptor) -> Self {
        let (broker, file) = match descriptor.source {
            SourceConfig::Broker(b) => (Some(b), None),
            SourceConfig::File(f) => (None, Some(f)),
        };
        Self {
            event_source_name: descriptor.event_source_name,
            event_name: descriptor.event_name,
            broker,
            file,
        }
    }
}

impl EventSourceDescriptor {
    /// Parse and validate a YAML (or JSON) descriptor
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Parse and validate a JSON descriptor
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read and parse a descriptor file; `.json` files use the JSON parser
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    /// Kind of source this descriptor configures
    pub fn source_type(&self) -> EventSourceType {
        match self.source {
            SourceConfig::Broker(_) => EventSourceType::Broker,
            SourceConfig::File(_) => EventSourceType::File,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROKER_YAML: &str = r#"
eventSourceName: orders
eventName: order-created
unknownTopLevel: ignored
broker:
  broker: ws://emitter.local:8080
  channelKey: k3y
  channelName: orders/
  jsonBody: true
  somethingElse: 42
  metadata:
    team: checkout
  username:
    name: emitter-creds
    key: username
  connectionBackoff:
    duration: 500ms
    factor: 2
    steps: 3
"#;

    #[test]
    fn test_broker_descriptor_parsing() {
        let descriptor = EventSourceDescriptor::from_yaml_str(BROKER_YAML).unwrap();

        assert_eq!(descriptor.event_source_name, "orders");
        assert_eq!(descriptor.event_name, "order-created");
        assert_eq!(descriptor.source_type(), EventSourceType::Broker);

        let SourceConfig::Broker(broker) = &descriptor.source else {
            panic!("expected broker source");
        };
        assert_eq!(broker.broker, "ws://emitter.local:8080");
        assert_eq!(broker.channel_key, "k3y");
        assert_eq!(broker.channel_name, "orders/");
        assert!(broker.json_body);
        assert_eq!(broker.metadata.get("team").map(String::as_str), Some("checkout"));
        assert_eq!(broker.username.as_ref().unwrap().to_string(), "emitter-creds/username");

        let backoff = broker.backoff();
        assert_eq!(backoff.duration, Duration::from_millis(500));
        assert_eq!(backoff.steps, 3);
    }

    #[test]
    fn test_missing_required_fields_fail_at_parse_time() {
        let missing_broker = r#"
eventSourceName: orders
eventName: order-created
broker:
  channelKey: k
  channelName: c
"#;
        assert!(EventSourceDescriptor::from_yaml_str(missing_broker).is_err());

        let empty_channel = r#"
eventSourceName: orders
eventName: order-created
broker:
  broker: ws://x
  channelKey: k
  channelName: ""
"#;
        let err = EventSourceDescriptor::from_yaml_str(empty_channel).unwrap_err();
        assert!(err.to_string().contains("channelName"));

        let no_source = "eventSourceName: a\neventName: b\n";
        assert!(EventSourceDescriptor::from_yaml_str(no_source).is_err());
    }

    #[test]
    fn test_json_descriptor() {
        let json = r#"{
            "eventSourceName": "s",
            "eventName": "e",
            "broker": {"broker": "x", "channelName": "c", "channelKey": "k", "jsonBody": false}
        }"#;
        let descriptor = EventSourceDescriptor::from_json_str(json).unwrap();
        let SourceConfig::Broker(broker) = descriptor.source else {
            panic!("expected broker source");
        };
        assert!(!broker.json_body);
        assert!(broker.metadata.is_empty());
        assert_eq!(broker.backoff(), ConnectionBackoffPolicy::default());
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ConnectionBackoffPolicy {
            duration: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            steps: 4,
            cap: Some(Duration::from_millis(300)),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(300));
        assert_eq!(policy.total_delay(), Duration::from_millis(600));
    }

    #[test]
    fn test_backoff_validation() {
        let mut policy = ConnectionBackoffPolicy::default();
        assert!(policy.validate().is_ok());

        policy.steps = 0;
        assert!(policy.validate().is_err());

        policy.steps = 1;
        policy.factor = 0.5;
        assert!(policy.validate().is_err());

        policy.factor = 1.0;
        policy.jitter = 1.5;
        assert!(policy.validate().is_err());
    }
}
