//! Generic adapter driving any [`SourceTransport`] through the lifecycle
//!
//! `start_listening` runs the whole life of one instance:
//!
//! 1. resolve secrets, then connect with backoff
//! 2. subscribe, registering an [`EventHandler`]
//! 3. open the message gate and wait for cancellation
//! 4. close the gate, unsubscribe and close, all within the unsubscribe timeout
//!
//! Any failure before step 3 closes what was opened and returns the error.
//! Cancellation is honoured during every startup step and ends the run with
//! [`AdapterError::Cancelled`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use types::{ConnectionBackoffPolicy, EventSourceType};

use super::connection;
use super::lifecycle::{LifecycleController, LifecycleState};
use super::normalizer;
use super::subscription::{ChannelSpec, InboundMessage, MessageHandler, SourceTransport};
use super::EventSource;
use crate::config::AdapterConfig;
use crate::error::{
    AdapterError, SubscriptionError, TransportError, UnsubscribeError,
};
use crate::metrics::{Metrics, NoopMetrics};
use crate::output::{Dispatch, DispatchOptions, DispatcherBridge};
use crate::Result;

/// Adapter for one descriptor over transport `T`
pub struct SourceAdapter<T: SourceTransport> {
    event_source_name: String,
    event_name: String,
    event_source_type: EventSourceType,
    channel: ChannelSpec,
    json_body: bool,
    metadata: BTreeMap<String, String>,
    backoff: ConnectionBackoffPolicy,
    transport: T,
    metrics: Arc<dyn Metrics>,
    unsubscribe_timeout: Duration,
    connect_timeout: Duration,
    dispatch_timeout: Option<Duration>,
    lifecycle: Arc<LifecycleController>,
}

impl<T: SourceTransport> SourceAdapter<T> {
    /// Adapter with default settings and no metrics
    pub fn new(
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
        event_source_type: EventSourceType,
        channel: ChannelSpec,
        transport: T,
    ) -> Self {
        let defaults = AdapterConfig::default();
        Self {
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            event_source_type,
            channel,
            json_body: false,
            metadata: BTreeMap::new(),
            backoff: ConnectionBackoffPolicy::default(),
            transport,
            metrics: Arc::new(NoopMetrics),
            unsubscribe_timeout: defaults.unsubscribe_timeout,
            connect_timeout: defaults.connect_timeout,
            dispatch_timeout: defaults.dispatch_timeout,
            lifecycle: Arc::new(LifecycleController::new()),
        }
    }

    /// Embed payloads as structured JSON
    pub fn with_json_body(mut self, json_body: bool) -> Self {
        self.json_body = json_body;
        self
    }

    /// Metadata copied into every event
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Connection retry policy
    pub fn with_backoff(mut self, backoff: ConnectionBackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Apply runtime timeouts
    pub fn with_config(mut self, config: &AdapterConfig) -> Self {
        self.unsubscribe_timeout = config.unsubscribe_timeout;
        self.connect_timeout = config.connect_timeout;
        self.dispatch_timeout = config.dispatch_timeout;
        self
    }

    /// Transport used by this adapter
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Stream of lifecycle transitions
    pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    async fn run(
        &self,
        mut shutdown: broadcast::Receiver<()>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<()> {
        let settings = tokio::select! {
            result = self.transport.prepare() => result?,
            _ = shutdown.recv() => return Err(self.cancelled()),
        };
        let address = self.transport.address();

        let connection = tokio::select! {
            result = self.connect(&address, &settings) => result?,
            _ = shutdown.recv() => return Err(self.cancelled()),
        };

        let handler = Arc::new(EventHandler {
            lifecycle: self.lifecycle.clone(),
            bridge: DispatcherBridge::new(
                self.event_source_name.clone(),
                self.event_name.clone(),
                dispatch,
                self.metrics.clone(),
            )
            .with_timeout(self.dispatch_timeout),
            metadata: self.metadata.clone(),
            json_body: self.json_body,
        });

        let subscribed = tokio::select! {
            result = self.transport.subscribe(&connection, &self.channel, handler) => Some(result),
            _ = shutdown.recv() => None,
        };
        let handle = match subscribed {
            Some(Ok(handle)) => handle,
            Some(Err(source)) => {
                self.transport.close(connection).await;
                return Err(SubscriptionError {
                    channel: self.channel.name.clone(),
                    source,
                }
                .into());
            }
            None => {
                let closed =
                    tokio::time::timeout(self.unsubscribe_timeout, self.transport.close(connection));
                if closed.await.is_err() {
                    warn!(address = %address, "connection close did not finish before the deadline");
                }
                return Err(self.cancelled());
            }
        };

        self.lifecycle.subscribed();
        info!(
            event_source_type = %self.event_source_type,
            event_source_name = %self.event_source_name,
            event_name = %self.event_name,
            channel_name = %self.channel.name,
            "subscribed, listening for events"
        );

        // a message or every sender dropping both mean stop
        let _ = shutdown.recv().await;
        info!(
            event_source_name = %self.event_source_name,
            event_name = %self.event_name,
            "event source is stopped"
        );

        let deadline = Instant::now() + self.unsubscribe_timeout;
        self.lifecycle.unsubscribing(self.unsubscribe_timeout).await;

        match tokio::time::timeout_at(deadline, self.transport.unsubscribe(&connection, handle)).await
        {
            Ok(Ok(())) => debug!(channel_name = %self.channel.name, "unsubscribed"),
            Ok(Err(source)) => {
                let err = UnsubscribeError {
                    channel: self.channel.name.clone(),
                    source,
                };
                error!(event_name = %self.event_name, error = %err, "unsubscribe failed");
            }
            Err(_) => {
                let err = UnsubscribeError {
                    channel: self.channel.name.clone(),
                    source: TransportError::Timeout {
                        timeout_ms: self.unsubscribe_timeout.as_millis() as u64,
                    },
                };
                error!(event_name = %self.event_name, error = %err, "unsubscribe failed");
            }
        }

        if tokio::time::timeout_at(deadline, self.transport.close(connection))
            .await
            .is_err()
        {
            warn!(address = %address, "connection close did not finish before the deadline");
        }

        Ok(())
    }

    fn cancelled(&self) -> AdapterError {
        AdapterError::Cancelled {
            event_name: self.event_name.clone(),
        }
    }

    async fn connect(&self, address: &str, settings: &T::Settings) -> Result<T::Connection> {
        let transport = &self.transport;
        let connect_timeout = self.connect_timeout;

        let connection = connection::establish(address, &self.backoff, move || async move {
            match tokio::time::timeout(connect_timeout, transport.connect(settings)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    timeout_ms: connect_timeout.as_millis() as u64,
                }),
            }
        })
        .await?;

        Ok(connection)
    }
}

#[async_trait]
impl<T: SourceTransport> EventSource for SourceAdapter<T> {
    fn event_source_name(&self) -> &str {
        &self.event_source_name
    }

    fn event_name(&self) -> &str {
        &self.event_name
    }

    fn event_source_type(&self) -> EventSourceType {
        self.event_source_type
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    async fn start_listening(
        &self,
        shutdown: broadcast::Receiver<()>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Result<()> {
        if !self.lifecycle.begin() {
            return Err(AdapterError::AlreadyStarted {
                event_name: self.event_name.clone(),
            });
        }

        info!(
            event_source_type = %self.event_source_type,
            event_source_name = %self.event_source_name,
            event_name = %self.event_name,
            address = %self.transport.address(),
            "started processing the event source"
        );

        let result = self.run(shutdown, dispatch).await;
        self.lifecycle.stopped();

        if let Err(e) = &result {
            error!(
                event_source_name = %self.event_source_name,
                event_name = %self.event_name,
                error = %e,
                "event source failed"
            );
        }
        result
    }
}

/// Per-message callback registered with the transport
pub struct EventHandler {
    lifecycle: Arc<LifecycleController>,
    bridge: DispatcherBridge,
    metadata: BTreeMap<String, String>,
    json_body: bool,
}

#[async_trait]
impl MessageHandler for EventHandler {
    async fn on_message(&self, message: InboundMessage) {
        let Some(_permit) = self.lifecycle.gate().enter().await else {
            debug!(
                topic = %message.topic,
                state = %self.lifecycle.state(),
                "dropping message received outside the subscribed state"
            );
            return;
        };

        let event = normalizer::normalize(&message, &self.metadata, self.json_body);
        // failures are logged and counted by the bridge
        let _ = self.bridge.forward(&event, DispatchOptions::default()).await;
    }
}
