//! Dispatch pipeline seam
//!
//! Adapters hand serialized events to a [`Dispatch`] implementation. The
//! [`DispatcherBridge`] sits between the adapter and the pipeline: it
//! serializes the envelope, calls the pipeline, and records exactly one of
//! {duration, failure} per message.
//!
//! Sinks provided here:
//! - [`RelayDispatcher`]: length-prefixed frames over a Unix socket
//! - [`StdoutDispatcher`]: one JSON document per line
//! - [`ChannelDispatcher`]: in-process `mpsc` channel

pub mod relay_output;
pub mod sinks;

pub use relay_output::{RelayDispatcher, RelayDispatcherStats};
pub use sinks::{ChannelDispatcher, DispatchedEvent, StdoutDispatcher};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use types::NormalizedEvent;

use crate::error::{DispatchError, MessageProcessingError};
use crate::input::normalizer;
use crate::metrics::Metrics;

/// Per-dispatch options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Explicit event id; pipelines may ignore it
    pub event_id: Option<String>,
}

/// External dispatch pipeline
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Hand one serialized event to the pipeline
    async fn dispatch(&self, event: Vec<u8>, options: DispatchOptions) -> Result<(), DispatchError>;
}

/// Serializes events, forwards them to the pipeline, and records metrics
pub struct DispatcherBridge {
    event_source_name: String,
    event_name: String,
    dispatch: Arc<dyn Dispatch>,
    metrics: Arc<dyn Metrics>,
    timeout: Option<Duration>,
}

impl DispatcherBridge {
    /// Bridge for one adapter instance
    pub fn new(
        event_source_name: impl Into<String>,
        event_name: impl Into<String>,
        dispatch: Arc<dyn Dispatch>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            event_source_name: event_source_name.into(),
            event_name: event_name.into(),
            dispatch,
            metrics,
            timeout: None,
        }
    }

    /// Fail dispatches that take longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Serialize and dispatch one event
    ///
    /// Failures are logged and counted here; the returned error is only
    /// informational for the caller.
    pub async fn forward(
        &self,
        event: &NormalizedEvent,
        options: DispatchOptions,
    ) -> Result<(), MessageProcessingError> {
        match self.try_forward(event, options).await {
            Ok(elapsed) => {
                let millis = elapsed.as_secs_f64() * 1000.0;
                self.metrics
                    .event_processing_duration(&self.event_source_name, &self.event_name, millis);
                debug!(
                    event_source_name = %self.event_source_name,
                    event_name = %self.event_name,
                    topic = %event.topic,
                    millis,
                    "dispatched event"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .event_processing_failed(&self.event_source_name, &self.event_name);
                error!(
                    event_source_name = %self.event_source_name,
                    event_name = %self.event_name,
                    topic = %event.topic,
                    error = %e,
                    "failed to process event"
                );
                Err(e)
            }
        }
    }

    async fn try_forward(
        &self,
        event: &NormalizedEvent,
        options: DispatchOptions,
    ) -> Result<Duration, MessageProcessingError> {
        let bytes = normalizer::serialize(event)?;
        let start = Instant::now();
        let dispatched = self.dispatch.dispatch(bytes, options);

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, dispatched)
                .await
                .map_err(|_| MessageProcessingError::DispatchTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                })??,
            None => dispatched.await?,
        }

        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AdapterMetrics;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    #[async_trait]
    impl Dispatch for Recorder {
        async fn dispatch(&self, event: Vec<u8>, _: DispatchOptions) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::Rejected("pipeline full".to_string()));
            }
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    struct Stalled;

    #[async_trait]
    impl Dispatch for Stalled {
        async fn dispatch(&self, _: Vec<u8>, _: DispatchOptions) -> Result<(), DispatchError> {
            std::future::pending().await
        }
    }

    fn event(payload: &[u8], json: bool) -> NormalizedEvent {
        NormalizedEvent::new("c", payload.to_vec(), json, BTreeMap::new())
    }

    #[tokio::test]
    async fn test_success_records_duration_only() {
        let recorder = Arc::new(Recorder::default());
        let metrics = Arc::new(AdapterMetrics::new());
        let bridge = DispatcherBridge::new("src", "evt", recorder.clone(), metrics.clone());

        bridge.forward(&event(b"hello", false), DispatchOptions::default()).await.unwrap();

        assert_eq!(recorder.events.lock().await.len(), 1);
        let snapshot = metrics.snapshot("src", "evt");
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.failed, 0);
    }

    #[tokio::test]
    async fn test_serialize_failure_skips_dispatch() {
        let recorder = Arc::new(Recorder::default());
        let metrics = Arc::new(AdapterMetrics::new());
        let bridge = DispatcherBridge::new("src", "evt", recorder.clone(), metrics.clone());

        let result = bridge.forward(&event(b"{broken", true), DispatchOptions::default()).await;

        assert!(result.is_err());
        assert!(recorder.events.lock().await.is_empty());
        assert_eq!(metrics.snapshot("src", "evt").failed, 1);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_counted() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let metrics = Arc::new(AdapterMetrics::new());
        let bridge = DispatcherBridge::new("src", "evt", recorder, metrics.clone());

        let err = bridge
            .forward(&event(b"x", false), DispatchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, MessageProcessingError::Dispatch(_)));
        let snapshot = metrics.snapshot("src", "evt");
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout() {
        let metrics = Arc::new(AdapterMetrics::new());
        let bridge = DispatcherBridge::new("src", "evt", Arc::new(Stalled), metrics.clone())
            .with_timeout(Some(Duration::from_millis(50)));

        let err = bridge
            .forward(&event(b"x", false), DispatchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, MessageProcessingError::DispatchTimeout { timeout_ms: 50 }));
        assert_eq!(metrics.snapshot("src", "evt").failed, 1);
    }
}
