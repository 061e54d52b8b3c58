//! Input side: connecting to sources and turning their messages into events

pub mod adapter;
pub mod connection;
pub mod lifecycle;
pub mod normalizer;
pub mod subscription;
pub mod transports;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use types::EventSourceType;

use crate::output::Dispatch;
use crate::Result;

pub use adapter::SourceAdapter;
pub use connection::{establish, Backoff};
pub use lifecycle::{LifecycleController, LifecycleState, MessageGate};
pub use subscription::{
    ChannelSpec, InboundMessage, MessageHandler, SourceTransport, SubscriptionHandle,
};

/// Contract every inbound-event connector satisfies
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Name of the event source this adapter belongs to
    fn event_source_name(&self) -> &str;

    /// Name of the event this adapter produces
    fn event_name(&self) -> &str;

    /// Kind of source
    fn event_source_type(&self) -> EventSourceType;

    /// Current lifecycle state
    fn state(&self) -> LifecycleState;

    /// Connect, subscribe, and forward messages to `dispatch` until `shutdown` fires
    ///
    /// Returns `Ok(())` after a graceful teardown. Returns an error without
    /// ever dispatching if the subscription could not be established. Either
    /// a message on `shutdown` or all senders being dropped counts as
    /// cancellation. An instance can only be started once.
    async fn start_listening(
        &self,
        shutdown: broadcast::Receiver<()>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<()>;
}
