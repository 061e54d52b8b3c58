//! # Event Source Adapters
//!
//! ## Purpose
//!
//! Connectors that turn messages from external systems into normalized events
//! for a dispatch pipeline. Every connector follows the same contract
//! ([`EventSource`]): connect with backoff, subscribe, forward each message
//! through normalization and dispatch, and tear down on cancellation.
//!
//! ## Architecture Role
//!
//! ```text
//! Descriptor -> build_event_source -> SourceAdapter<Transport>
//!                                          |
//!   broker / directory -> transport -> EventHandler -> normalize -> DispatcherBridge -> Dispatch
//!                                                                      |
//!                                                                   Metrics
//! ```
//!
//! - **Connection establisher**: [`input::connection::establish`]
//! - **Subscription manager**: [`SourceTransport`] implementations in [`input::transports`]
//! - **Event normalizer**: [`input::normalizer`]
//! - **Dispatcher bridge**: [`output::DispatcherBridge`]
//! - **Lifecycle controller**: [`input::lifecycle::LifecycleController`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eventsource_adapters::{
//!     build_event_source, AdapterConfig, AdapterMetrics, StdoutDispatcher, VolumeSecretResolver,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AdapterConfig::from_env();
//! let descriptor = eventsource_adapters::config::load_descriptor("orders.yaml".as_ref())?;
//! let source = build_event_source(
//!     descriptor,
//!     &config,
//!     Arc::new(VolumeSecretResolver::new(&config.secrets_mount)),
//!     Arc::new(AdapterMetrics::new()),
//! )?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! let run = tokio::spawn({
//!     let source = source.clone();
//!     async move { source.start_listening(shutdown_rx, Arc::new(StdoutDispatcher::new())).await }
//! });
//! tokio::signal::ctrl_c().await?;
//! let _ = shutdown_tx.send(());
//! run.await??;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod input;
pub mod metrics;
pub mod output;
pub mod secrets;
pub mod supervisor;

use std::sync::Arc;

use types::{EventSourceDescriptor, EventSourceType, SourceConfig};

pub use config::AdapterConfig;
pub use error::{
    AdapterError, ConfigError, ConnectionError, DispatchError, MessageProcessingError, Result,
    SecretError, SubscriptionError, TransportError, UnsubscribeError,
};
pub use input::transports::{FileTransport, MemoryBroker, MemoryTransport, WebSocketTransport};
pub use input::{
    ChannelSpec, EventSource, InboundMessage, LifecycleState, MessageHandler, SourceAdapter,
    SourceTransport, SubscriptionHandle,
};
pub use metrics::{AdapterMetrics, EventMetricsSnapshot, Metrics, NoopMetrics};
pub use output::{
    ChannelDispatcher, Dispatch, DispatchOptions, DispatcherBridge, RelayDispatcher,
    StdoutDispatcher,
};
pub use secrets::{SecretResolver, VolumeSecretResolver};
pub use supervisor::{supervise, SupervisedExit};

/// Build the adapter a descriptor asks for
///
/// Broker descriptors get the WebSocket transport; file descriptors get the
/// polling watcher. Use [`SourceAdapter::new`] directly to pick another
/// transport, e.g. [`MemoryTransport`].
pub fn build_event_source(
    descriptor: EventSourceDescriptor,
    config: &AdapterConfig,
    secrets: Arc<dyn SecretResolver>,
    metrics: Arc<dyn Metrics>,
) -> Result<Arc<dyn EventSource>> {
    config.validate()?;
    let EventSourceDescriptor {
        event_source_name,
        event_name,
        source,
    } = descriptor;

    let source: Arc<dyn EventSource> = match source {
        SourceConfig::Broker(broker) => {
            let channel = ChannelSpec {
                key: broker.channel_key.clone(),
                name: broker.channel_name.clone(),
            };
            let json_body = broker.json_body;
            let metadata = broker.metadata.clone();
            let backoff = broker.backoff();
            let transport = WebSocketTransport::new(broker, secrets);

            Arc::new(
                SourceAdapter::new(
                    event_source_name,
                    event_name,
                    EventSourceType::Broker,
                    channel,
                    transport,
                )
                .with_json_body(json_body)
                .with_metadata(metadata)
                .with_backoff(backoff)
                .with_metrics(metrics)
                .with_config(config),
            )
        }
        SourceConfig::File(file) => {
            let channel = ChannelSpec {
                key: String::new(),
                name: file.watch_path.directory.clone(),
            };
            let metadata = file.metadata.clone();
            let transport = FileTransport::new(file)?;

            Arc::new(
                SourceAdapter::new(
                    event_source_name,
                    event_name,
                    EventSourceType::File,
                    channel,
                    transport,
                )
                .with_json_body(true)
                .with_metadata(metadata)
                .with_metrics(metrics)
                .with_config(config),
            )
        }
    };

    Ok(source)
}
