//! Lifecycle tests for broker adapters over the in-memory broker
//!
//! Covers:
//! - subscribe succeeds only when connect and subscribe both succeed
//! - one dispatch or one failure per message while subscribed
//! - opaque and JSON body wire forms
//! - cancellation, including before the subscription exists
//! - instances are not restartable

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use eventsource_adapters::{
    AdapterConfig, AdapterError, AdapterMetrics, ChannelSpec, Dispatch, DispatchError,
    DispatchOptions, EventSource, LifecycleState, MemoryBroker, MemoryTransport, SourceAdapter,
    VolumeSecretResolver,
};
use types::{BrokerEventSource, ConnectionBackoffPolicy, EventSourceType, SecretRef, TlsConfig};

#[derive(Default)]
struct RecordingDispatcher {
    events: Mutex<Vec<Vec<u8>>>,
    fail: AtomicBool,
}

impl RecordingDispatcher {
    async fn recorded(&self) -> Vec<Value> {
        self.events
            .lock()
            .await
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
            .collect()
    }

    async fn count(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl Dispatch for RecordingDispatcher {
    async fn dispatch(&self, event: Vec<u8>, _: DispatchOptions) -> Result<(), DispatchError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError::Rejected("pipeline unavailable".to_string()));
        }
        self.events.lock().await.push(event);
        Ok(())
    }
}

fn broker_config(json_body: bool) -> BrokerEventSource {
    BrokerEventSource {
        broker: "x".to_string(),
        channel_key: "k".to_string(),
        channel_name: "c".to_string(),
        username: None,
        password: None,
        tls: None,
        json_body,
        metadata: Default::default(),
        connection_backoff: None,
    }
}

fn fast_backoff(steps: u32) -> ConnectionBackoffPolicy {
    ConnectionBackoffPolicy {
        duration: Duration::from_millis(10),
        factor: 2.0,
        jitter: 0.0,
        steps,
        cap: None,
    }
}

struct Harness {
    broker: MemoryBroker,
    adapter: Arc<SourceAdapter<MemoryTransport>>,
    metrics: Arc<AdapterMetrics>,
    dispatcher: Arc<RecordingDispatcher>,
    shutdown: broadcast::Sender<()>,
}

impl Harness {
    fn new(config: BrokerEventSource) -> Self {
        Self::with_secrets(config, VolumeSecretResolver::new("/nonexistent"))
    }

    fn with_secrets(config: BrokerEventSource, secrets: VolumeSecretResolver) -> Self {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(AdapterMetrics::new());
        let channel = ChannelSpec {
            key: config.channel_key.clone(),
            name: config.channel_name.clone(),
        };
        let json_body = config.json_body;
        let metadata = config.metadata.clone();
        let transport = MemoryTransport::new(broker.clone(), config, Arc::new(secrets));

        let adapter = SourceAdapter::new("orders", "created", EventSourceType::Broker, channel, transport)
            .with_json_body(json_body)
            .with_metadata(metadata)
            .with_backoff(fast_backoff(3))
            .with_metrics(metrics.clone())
            .with_config(&AdapterConfig {
                unsubscribe_timeout: Duration::from_secs(1),
                ..AdapterConfig::default()
            });

        let (shutdown, _) = broadcast::channel(1);
        Self {
            broker,
            adapter: Arc::new(adapter),
            metrics,
            dispatcher: Arc::new(RecordingDispatcher::default()),
            shutdown,
        }
    }

    fn start(&self) -> JoinHandle<Result<(), AdapterError>> {
        let adapter = self.adapter.clone();
        let rx = self.shutdown.subscribe();
        let dispatcher: Arc<dyn Dispatch> = self.dispatcher.clone();
        tokio::spawn(async move { adapter.start_listening(rx, dispatcher).await })
    }

    async fn wait_for(&self, state: LifecycleState) {
        let mut changes = self.adapter.state_changes();
        tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for lifecycle state")
            .expect("lifecycle controller dropped");
    }

    async fn stop(&self, run: JoinHandle<Result<(), AdapterError>>) -> Result<(), AdapterError> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("adapter did not stop in time")
            .expect("adapter task panicked")
    }
}

#[tokio::test]
async fn test_opaque_message_is_dispatched_once() {
    let harness = Harness::new(broker_config(false));
    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;

    assert_eq!(harness.broker.deliver("c", &b"hello"[..]).await, 1);

    harness.stop(run).await.unwrap();
    assert_eq!(harness.adapter.state(), LifecycleState::Stopped);

    let events = harness.dispatcher.events.lock().await.clone();
    assert_eq!(events.len(), 1);
    assert_eq!(
        String::from_utf8(events[0].clone()).unwrap(),
        r#"{"topic":"c","body":"aGVsbG8=","metadata":{}}"#
    );

    let snapshot = harness.metrics.snapshot("orders", "created");
    assert_eq!(snapshot.processed, 1);
    assert_eq!(snapshot.failed, 0);

    assert_eq!(harness.broker.subscriber_count(), 0);
    assert_eq!(harness.broker.connection_count(), 0);
}

#[tokio::test]
async fn test_json_body_is_embedded_structurally() {
    let mut config = broker_config(true);
    config.metadata.insert("team".to_string(), "checkout".to_string());
    let harness = Harness::new(config);
    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;

    harness.broker.deliver("c", &br#"{"a":1}"#[..]).await;
    harness.stop(run).await.unwrap();

    let events = harness.dispatcher.recorded().await;
    assert_eq!(
        events,
        vec![json!({"topic": "c", "body": {"a": 1}, "metadata": {"team": "checkout"}})]
    );
}

#[tokio::test]
async fn test_invalid_json_counts_failure_and_keeps_listening() {
    let harness = Harness::new(broker_config(true));
    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;

    harness.broker.deliver("c", &b"not json"[..]).await;
    harness.broker.deliver("c", &b"[1,2]"[..]).await;
    assert_eq!(harness.adapter.state(), LifecycleState::Subscribed);

    harness.stop(run).await.unwrap();

    assert_eq!(harness.dispatcher.count().await, 1);
    let snapshot = harness.metrics.snapshot("orders", "created");
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.processed, 1);
}

#[tokio::test]
async fn test_dispatch_failure_is_recorded_once() {
    let harness = Harness::new(broker_config(false));
    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;

    harness.dispatcher.fail.store(true, Ordering::SeqCst);
    harness.broker.deliver("c", &b"one"[..]).await;
    harness.dispatcher.fail.store(false, Ordering::SeqCst);
    harness.broker.deliver("c", &b"two"[..]).await;

    harness.stop(run).await.unwrap();

    let snapshot = harness.metrics.snapshot("orders", "created");
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.processed, 1);
    assert_eq!(harness.dispatcher.count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_never_dispatches() {
    let harness = Harness::new(broker_config(false));
    harness.broker.fail_next_connects(u32::MAX);

    let err = harness.start().await.unwrap().unwrap_err();

    assert!(matches!(err, AdapterError::Connection(_)));
    assert!(err.is_recoverable());
    assert!(err.to_string().contains("connect to x"));
    assert_eq!(harness.broker.connect_attempts(), 3);
    assert_eq!(harness.adapter.state(), LifecycleState::Stopped);
    assert_eq!(harness.dispatcher.count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_recovers_within_backoff() {
    let harness = Harness::new(broker_config(false));
    harness.broker.fail_next_connects(2);

    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;
    assert_eq!(harness.broker.connect_attempts(), 3);

    harness.stop(run).await.unwrap();
}

#[tokio::test]
async fn test_subscribe_failure_closes_connection() {
    let harness = Harness::new(broker_config(false));
    harness.broker.reject_subscriptions(true);

    let err = harness.start().await.unwrap().unwrap_err();

    match &err {
        AdapterError::Subscription(e) => assert_eq!(e.channel, "c"),
        other => panic!("expected subscription error, got {other:?}"),
    }
    assert_eq!(harness.broker.connection_count(), 0);
    assert_eq!(harness.adapter.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_unsubscribe_failure_is_not_fatal() {
    let harness = Harness::new(broker_config(false));
    harness.broker.reject_unsubscriptions(true);

    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;
    harness.stop(run).await.unwrap();

    assert_eq!(harness.adapter.state(), LifecycleState::Stopped);
    // closing the connection still releases the registration
    assert_eq!(harness.broker.deliver("c", &b"late"[..]).await, 0);
    assert_eq!(harness.dispatcher.count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_while_connecting() {
    let harness = Harness::new(broker_config(false));
    harness.broker.fail_next_connects(u32::MAX);

    let adapter = Arc::new(
        SourceAdapter::new(
            "orders",
            "created",
            EventSourceType::Broker,
            ChannelSpec {
                key: "k".to_string(),
                name: "c".to_string(),
            },
            MemoryTransport::new(
                harness.broker.clone(),
                broker_config(false),
                Arc::new(VolumeSecretResolver::new("/nonexistent")),
            ),
        )
        .with_backoff(ConnectionBackoffPolicy {
            duration: Duration::from_secs(60),
            factor: 1.0,
            jitter: 0.0,
            steps: 100,
            cap: None,
        }),
    );

    let (tx, rx) = broadcast::channel(1);
    let run = {
        let adapter = adapter.clone();
        let dispatcher: Arc<dyn Dispatch> = harness.dispatcher.clone();
        tokio::spawn(async move { adapter.start_listening(rx, dispatcher).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(adapter.state(), LifecycleState::Connecting);
    drop(tx);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, AdapterError::Cancelled { .. }));
    assert_eq!(adapter.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_dropping_every_sender_stops_the_adapter() {
    let Harness {
        broker,
        adapter,
        dispatcher,
        shutdown,
        ..
    } = Harness::new(broker_config(false));

    let run = {
        let adapter = adapter.clone();
        let rx = shutdown.subscribe();
        let dispatcher: Arc<dyn Dispatch> = dispatcher.clone();
        tokio::spawn(async move { adapter.start_listening(rx, dispatcher).await })
    };
    let mut changes = adapter.state_changes();
    changes
        .wait_for(|s| *s == LifecycleState::Subscribed)
        .await
        .unwrap();

    drop(shutdown);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(broker.subscriber_count(), 0);
}

#[tokio::test]
async fn test_adapter_is_not_restartable() {
    let harness = Harness::new(broker_config(false));
    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;
    harness.stop(run).await.unwrap();

    let err = harness.start().await.unwrap().unwrap_err();
    assert!(matches!(err, AdapterError::AlreadyStarted { .. }));
    assert!(err.is_permanent());
    assert_eq!(harness.broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_concurrent_deliveries_are_all_dispatched() {
    let harness = Harness::new(broker_config(false));
    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;

    for i in 0..20 {
        assert_eq!(harness.broker.publish("c", format!("m{i}").into_bytes()), 1);
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.dispatcher.count().await < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("not every message was dispatched");

    harness.stop(run).await.unwrap();
    assert_eq!(harness.metrics.snapshot("orders", "created").processed, 20);
}

#[tokio::test]
async fn test_missing_secret_aborts_before_connecting() {
    let mut config = broker_config(false);
    config.username = Some(SecretRef {
        name: "creds".to_string(),
        key: "username".to_string(),
    });
    let harness = Harness::new(config);

    let err = harness.start().await.unwrap().unwrap_err();
    assert!(matches!(err, AdapterError::Secret(_)));
    assert!(err.is_permanent());
    assert_eq!(harness.broker.connect_attempts(), 0);
}

#[tokio::test]
async fn test_credentials_are_resolved_from_mount() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("creds")).unwrap();
    std::fs::write(dir.path().join("creds/username"), "alice\n").unwrap();
    std::fs::write(dir.path().join("creds/password"), "pw\n").unwrap();

    let mut config = broker_config(false);
    config.username = Some(SecretRef {
        name: "creds".to_string(),
        key: "username".to_string(),
    });
    config.password = Some(SecretRef {
        name: "creds".to_string(),
        key: "password".to_string(),
    });
    let harness = Harness::with_secrets(config, VolumeSecretResolver::new(dir.path()));
    harness.broker.require_credentials("alice", "pw");

    let run = harness.start();
    harness.wait_for(LifecycleState::Subscribed).await;
    harness.stop(run).await.unwrap();
}

/// Records the lifecycle state each dispatch starts in
struct StateObservingDispatcher {
    state: watch::Receiver<LifecycleState>,
    dispatched: AtomicUsize,
    after_unsubscribing: AtomicUsize,
}

#[async_trait]
impl Dispatch for StateObservingDispatcher {
    async fn dispatch(&self, _: Vec<u8>, _: DispatchOptions) -> Result<(), DispatchError> {
        let state = *self.state.borrow();
        if matches!(state, LifecycleState::Unsubscribing | LifecycleState::Stopped) {
            self.after_unsubscribing.fetch_add(1, Ordering::SeqCst);
        }
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_dispatch_starts_once_unsubscribing_is_observed() {
    let harness = Harness::new(broker_config(false));
    let observer = Arc::new(StateObservingDispatcher {
        state: harness.adapter.state_changes(),
        dispatched: AtomicUsize::new(0),
        after_unsubscribing: AtomicUsize::new(0),
    });

    let run = {
        let adapter = harness.adapter.clone();
        let rx = harness.shutdown.subscribe();
        let dispatcher: Arc<dyn Dispatch> = observer.clone();
        tokio::spawn(async move { adapter.start_listening(rx, dispatcher).await })
    };
    harness.wait_for(LifecycleState::Subscribed).await;

    let publisher = {
        let broker = harness.broker.clone();
        tokio::spawn(async move {
            for i in 0..2000 {
                broker.publish("c", format!("m{i}").into_bytes());
                tokio::task::yield_now().await;
            }
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    harness.stop(run).await.unwrap();
    publisher.await.unwrap();

    assert!(observer.dispatched.load(Ordering::SeqCst) > 0);
    assert_eq!(observer.after_unsubscribing.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unusable_tls_material_aborts_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("tls")).unwrap();
    std::fs::write(dir.path().join("tls/ca.crt"), "not a pem").unwrap();

    let mut config = broker_config(false);
    config.tls = Some(TlsConfig {
        ca_cert_secret: Some(SecretRef {
            name: "tls".to_string(),
            key: "ca.crt".to_string(),
        }),
        ..TlsConfig::default()
    });
    let harness = Harness::with_secrets(config, VolumeSecretResolver::new(dir.path()));

    let err = harness.start().await.unwrap().unwrap_err();
    assert!(matches!(err, AdapterError::Secret(_)));
    assert!(err.is_permanent());
    assert_eq!(harness.broker.connect_attempts(), 0);
    assert_eq!(harness.adapter.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_cancellation_while_subscribe_hangs() {
    let harness = Harness::new(broker_config(false));
    harness.broker.stall_subscriptions(true);

    let run = harness.start();
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.broker.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("adapter never connected");
    assert_eq!(harness.adapter.state(), LifecycleState::Connecting);

    let err = harness.stop(run).await.unwrap_err();
    assert!(matches!(err, AdapterError::Cancelled { .. }));
    assert_eq!(harness.broker.connection_count(), 0);
    assert_eq!(harness.adapter.state(), LifecycleState::Stopped);
}
