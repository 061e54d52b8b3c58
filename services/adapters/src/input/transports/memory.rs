//! In-process broker
//!
//! [`MemoryBroker`] keeps subscriptions in a map and fans published messages
//! out to matching handlers. Connect, subscribe and unsubscribe failures can
//! be injected to exercise the adapter lifecycle without a network.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use types::BrokerEventSource;

use super::{channel_matches, BrokerSettings};
use crate::error::{SecretError, TransportError};
use crate::input::subscription::{
    ChannelSpec, InboundMessage, MessageHandler, SourceTransport, SubscriptionHandle,
};
use crate::secrets::SecretResolver;

struct Subscriber {
    connection: u64,
    channel: ChannelSpec,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct BrokerState {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    open_connections: DashMap<u64, Option<String>>,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    reject_subscribe: AtomicBool,
    stall_subscribe: AtomicBool,
    reject_unsubscribe: AtomicBool,
    credentials: std::sync::RwLock<Option<(String, String)>>,
}

/// Shared handle to an in-process broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Empty broker accepting every connection
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials on connect
    pub fn require_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        if let Ok(mut guard) = self.state.credentials.write() {
            *guard = Some((username.into(), password.into()));
        }
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Refuse every subscribe request
    pub fn reject_subscriptions(&self, reject: bool) {
        self.state.reject_subscribe.store(reject, Ordering::SeqCst);
    }

    /// Never answer subscribe requests
    pub fn stall_subscriptions(&self, stall: bool) {
        self.state.stall_subscribe.store(stall, Ordering::SeqCst);
    }

    /// Refuse every unsubscribe request
    pub fn reject_unsubscriptions(&self, reject: bool) {
        self.state.reject_unsubscribe.store(reject, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, failed ones included
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.len()
    }

    /// Open connections
    pub fn connection_count(&self) -> usize {
        self.state.open_connections.len()
    }

    /// Drop every connection and subscription as if the broker restarted
    pub fn disconnect_all(&self) {
        self.state.subscribers.clear();
        self.state.open_connections.clear();
    }

    fn matching(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.state
            .subscribers
            .iter()
            .filter(|entry| channel_matches(&entry.channel.name, topic))
            .map(|entry| entry.handler.clone())
            .collect()
    }

    /// Deliver a message to matching subscribers on their own tasks
    ///
    /// Returns the number of subscribers the message was handed to.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let message = InboundMessage::new(topic, payload);
        let handlers = self.matching(topic);
        for handler in &handlers {
            let handler = handler.clone();
            let message = message.clone();
            tokio::spawn(async move { handler.on_message(message).await });
        }
        handlers.len()
    }

    /// Deliver a message and wait until every matching handler returned
    pub async fn deliver(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        let message = InboundMessage::new(topic, payload);
        let handlers = self.matching(topic);
        for handler in &handlers {
            handler.on_message(message.clone()).await;
        }
        handlers.len()
    }

    fn connect(&self, username: Option<&str>, password: Option<&str>) -> Result<u64, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.state.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Rejected("broker unavailable".to_string()));
        }

        let required = self
            .state
            .credentials
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        if let Some((user, pass)) = required {
            if username != Some(user.as_str()) || password != Some(pass.as_str()) {
                return Err(TransportError::Rejected("invalid credentials".to_string()));
            }
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state
            .open_connections
            .insert(id, username.map(str::to_string));
        Ok(id)
    }
}

/// Live connection to a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
}

/// Transport over a [`MemoryBroker`]
pub struct MemoryTransport {
    broker: MemoryBroker,
    config: BrokerEventSource,
    secrets: Arc<dyn SecretResolver>,
}

impl MemoryTransport {
    /// Transport for `config` connecting to `broker`
    pub fn new(
        broker: MemoryBroker,
        config: BrokerEventSource,
        secrets: Arc<dyn SecretResolver>,
    ) -> Self {
        Self {
            broker,
            config,
            secrets,
        }
    }

    /// Broker this transport talks to
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl SourceTransport for MemoryTransport {
    type Settings = BrokerSettings;
    type Connection = MemoryConnection;

    fn address(&self) -> String {
        self.config.broker.clone()
    }

    async fn prepare(&self) -> Result<BrokerSettings, SecretError> {
        BrokerSettings::resolve(&self.config, self.secrets.as_ref())
    }

    async fn connect(&self, settings: &BrokerSettings) -> Result<MemoryConnection, TransportError> {
        let id = self
            .broker
            .connect(settings.username.as_deref(), settings.password.as_deref())?;
        Ok(MemoryConnection { id })
    }

    async fn subscribe(
        &self,
        connection: &MemoryConnection,
        channel: &ChannelSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let state = &self.broker.state;
        if !state.open_connections.contains_key(&connection.id) {
            return Err(TransportError::NotConnected);
        }
        if state.stall_subscribe.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if state.reject_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!(
                "subscription to {} refused",
                channel.name
            )));
        }

        let id = state.next_id.fetch_add(1, Ordering::SeqCst);
        state.subscribers.insert(
            id,
            Subscriber {
                connection: connection.id,
                channel: channel.clone(),
                handler,
            },
        );
        debug!(channel = %channel.name, id, "memory subscription registered");

        Ok(SubscriptionHandle {
            id,
            channel: channel.clone(),
        })
    }

    async fn unsubscribe(
        &self,
        _connection: &MemoryConnection,
        handle: SubscriptionHandle,
    ) -> Result<(), TransportError> {
        let state = &self.broker.state;
        if state.reject_unsubscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!(
                "unsubscribe from {} refused",
                handle.channel.name
            )));
        }
        // already gone after a lost connection, which is fine
        state.subscribers.remove(&handle.id);
        Ok(())
    }

    async fn close(&self, connection: MemoryConnection) {
        let state = &self.broker.state;
        state
            .subscribers
            .retain(|_, subscriber| subscriber.connection != connection.id);
        state.open_connections.remove(&connection.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::VolumeSecretResolver;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<InboundMessage>>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn on_message(&self, message: InboundMessage) {
            self.0.lock().await.push(message);
        }
    }

    fn transport(broker: &MemoryBroker) -> MemoryTransport {
        let config = BrokerEventSource {
            broker: "memory://local".to_string(),
            channel_key: "k".to_string(),
            channel_name: "orders".to_string(),
            username: None,
            password: None,
            tls: None,
            json_body: false,
            metadata: Default::default(),
            connection_backoff: None,
        };
        MemoryTransport::new(
            broker.clone(),
            config,
            Arc::new(VolumeSecretResolver::new("/nonexistent")),
        )
    }

    fn channel(name: &str) -> ChannelSpec {
        ChannelSpec {
            key: "k".to_string(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let settings = transport.prepare().await.unwrap();
        let connection = transport.connect(&settings).await.unwrap();

        let collected = Arc::new(Collect::default());
        let handle = transport
            .subscribe(&connection, &channel("orders"), collected.clone())
            .await
            .unwrap();

        assert_eq!(broker.deliver("orders", &b"one"[..]).await, 1);
        assert_eq!(broker.deliver("payments", &b"two"[..]).await, 0);
        assert_eq!(collected.0.lock().await.len(), 1);

        transport.unsubscribe(&connection, handle).await.unwrap();
        assert_eq!(broker.subscriber_count(), 0);
        transport.close(connection).await;
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let settings = transport.prepare().await.unwrap();

        broker.fail_next_connects(1);
        assert!(transport.connect(&settings).await.is_err());
        let connection = transport.connect(&settings).await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);

        broker.reject_subscriptions(true);
        let handler: Arc<dyn MessageHandler> = Arc::new(Collect::default());
        assert!(transport
            .subscribe(&connection, &channel("orders"), handler)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_after_connection_loss_is_safe() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let settings = transport.prepare().await.unwrap();
        let connection = transport.connect(&settings).await.unwrap();
        let handle = transport
            .subscribe(&connection, &channel("orders"), Arc::new(Collect::default()))
            .await
            .unwrap();

        broker.disconnect_all();
        assert!(transport.unsubscribe(&connection, handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_required_credentials() {
        let broker = MemoryBroker::new();
        broker.require_credentials("alice", "pw");
        let transport = transport(&broker);

        let err = transport.connect(&BrokerSettings::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));

        let settings = BrokerSettings {
            username: Some("alice".to_string()),
            password: Some("pw".to_string()),
            tls: None,
        };
        assert!(transport.connect(&settings).await.is_ok());
    }
}
