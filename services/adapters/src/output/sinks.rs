//! In-process and stdout dispatch sinks

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::{mpsc, Mutex};

use super::{Dispatch, DispatchOptions};
use crate::error::DispatchError;

/// One event as received by a [`ChannelDispatcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedEvent {
    /// Serialized envelope
    pub payload: Vec<u8>,
    /// Options passed alongside it
    pub options: DispatchOptions,
}

/// Forwards events into a bounded `mpsc` channel
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<DispatchedEvent>,
}

impl ChannelDispatcher {
    /// Dispatcher plus the receiving end, holding up to `capacity` events
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DispatchedEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatch for ChannelDispatcher {
    async fn dispatch(&self, event: Vec<u8>, options: DispatchOptions) -> Result<(), DispatchError> {
        self.tx
            .send(DispatchedEvent {
                payload: event,
                options,
            })
            .await
            .map_err(|_| DispatchError::Closed)
    }
}

/// Writes each event as one line on stdout
pub struct StdoutDispatcher {
    out: Mutex<Stdout>,
}

impl StdoutDispatcher {
    /// Dispatcher writing to the process stdout
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatch for StdoutDispatcher {
    async fn dispatch(&self, mut event: Vec<u8>, _options: DispatchOptions) -> Result<(), DispatchError> {
        event.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&event).await?;
        out.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_dispatcher() {
        let (dispatcher, mut rx) = ChannelDispatcher::new(4);
        let options = DispatchOptions {
            event_id: Some("id-1".to_string()),
        };

        dispatcher.dispatch(b"one".to_vec(), options.clone()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload, b"one");
        assert_eq!(received.options, options);

        drop(rx);
        let err = dispatcher
            .dispatch(b"two".to_vec(), DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Closed));
    }
}
