//! Subscription manager contract
//!
//! A transport owns the connection to an external source and delivers inbound
//! messages to a registered [`MessageHandler`]. Handlers are invoked from the
//! transport's own tasks, possibly concurrently, so implementations must be
//! reentrant and must not assume ordering between deliveries.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::{SecretError, TransportError};

/// Raw message as received from a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic, channel or path the message arrived on
    pub topic: String,
    /// Message payload
    pub payload: Bytes,
}

impl InboundMessage {
    /// Message on `topic` carrying `payload`
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Callback invoked once per inbound message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message; errors are the handler's own business
    async fn on_message(&self, message: InboundMessage);
}

/// Channel to register interest in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Access key for the channel
    pub key: String,
    /// Channel name, topic or path
    pub name: String,
}

/// Handle to an active registration; required to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Transport-assigned id
    pub id: u64,
    /// Channel the handle was issued for
    pub channel: ChannelSpec,
}

/// Connect/subscribe primitives for one kind of source
///
/// `prepare` resolves credentials and TLS material once per run. `connect` is
/// a single attempt; retries are applied by the caller. `unsubscribe` must be
/// safe to call after the connection was lost.
#[async_trait]
pub trait SourceTransport: Send + Sync + 'static {
    /// Resolved, per-run connection settings
    type Settings: Send + Sync;
    /// Live connection
    type Connection: Send + Sync;

    /// Address used in logs and connection errors
    fn address(&self) -> String;

    /// Resolve secrets and TLS material
    async fn prepare(&self) -> Result<Self::Settings, SecretError>;

    /// One connection attempt
    async fn connect(&self, settings: &Self::Settings) -> Result<Self::Connection, TransportError>;

    /// Register `handler` for messages on `channel`
    async fn subscribe(
        &self,
        connection: &Self::Connection,
        channel: &ChannelSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, TransportError>;

    /// Release a registration
    async fn unsubscribe(
        &self,
        connection: &Self::Connection,
        handle: SubscriptionHandle,
    ) -> Result<(), TransportError>;

    /// Tear down the connection
    async fn close(&self, connection: Self::Connection);
}
