//! Concrete transports
//!
//! - [`WebSocketTransport`]: broker reached over `ws://` or `wss://`
//! - [`MemoryTransport`]: in-process [`MemoryBroker`] for embedding and tests
//! - [`FileTransport`]: polling directory watcher

pub mod file;
pub mod memory;
pub mod websocket;

pub use file::{FileEvent, FileTransport};
pub use memory::{MemoryBroker, MemoryTransport};
pub use websocket::WebSocketTransport;

use std::fmt;

use types::BrokerEventSource;

use crate::error::SecretError;
use crate::secrets::{SecretResolver, TlsMaterial};

/// Credentials and TLS connector resolved for one broker run
#[derive(Clone, Default)]
pub struct BrokerSettings {
    /// Resolved username
    pub username: Option<String>,
    /// Resolved password
    pub password: Option<String>,
    /// TLS connector built from the referenced material
    pub tls: Option<native_tls::TlsConnector>,
}

impl BrokerSettings {
    /// Resolve every secret the broker block references
    ///
    /// TLS material is turned into a connector here, so unusable certificates
    /// fail before the first connection attempt.
    pub fn resolve(
        config: &BrokerEventSource,
        resolver: &dyn SecretResolver,
    ) -> Result<Self, SecretError> {
        let tls = config
            .tls
            .as_ref()
            .map(|tls| TlsMaterial::resolve(tls, resolver).and_then(|material| material.connector()))
            .transpose()?;
        let username = config
            .username
            .as_ref()
            .map(|s| resolver.resolve(s))
            .transpose()?;
        let password = config
            .password
            .as_ref()
            .map(|s| resolver.resolve(s))
            .transpose()?;

        Ok(Self {
            username,
            password,
            tls,
        })
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Whether a message on `topic` belongs to a subscription on `channel`
///
/// A channel ending in `/` is a prefix and matches every topic below it.
pub fn channel_matches(channel: &str, topic: &str) -> bool {
    if channel.ends_with('/') {
        topic.starts_with(channel)
    } else {
        channel == topic
    }
}
