//! Relay dispatcher - sends serialized events to a relay over a Unix socket
//!
//! Each event is written as one frame: a 4-byte big-endian length followed by
//! the JSON envelope. The connection is opened lazily on first dispatch and
//! re-established with exponential backoff after a write error.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{Dispatch, DispatchOptions};
use crate::error::DispatchError;

const MAX_ATTEMPTS: u32 = 10;
const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 30_000;

/// Dispatch pipeline backed by a relay Unix socket
pub struct RelayDispatcher {
    socket_path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
    messages_sent: AtomicU64,
    max_attempts: u32,
}

impl RelayDispatcher {
    /// Dispatcher for the relay listening on `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            stream: Mutex::new(None),
            messages_sent: AtomicU64::new(0),
            max_attempts: MAX_ATTEMPTS,
        }
    }

    /// Limit connection attempts per (re)connect
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Connect with exponential backoff
    async fn connect_with_retry(&self) -> Result<UnixStream, DispatchError> {
        let mut attempts = 0u32;

        loop {
            match UnixStream::connect(&self.socket_path).await {
                Ok(stream) => {
                    info!(socket = %self.socket_path.display(), "connected to relay");
                    return Ok(stream);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        error!(
                            socket = %self.socket_path.display(),
                            attempts,
                            error = %e,
                            "failed to connect to relay"
                        );
                        return Err(DispatchError::Io(e));
                    }

                    let delay_ms = (BASE_DELAY_MS * 2_u64.pow(attempts - 1)).min(MAX_DELAY_MS);
                    warn!(
                        socket = %self.socket_path.display(),
                        attempt = attempts,
                        retry_in_ms = delay_ms,
                        error = %e,
                        "relay connection attempt failed, retrying"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    fn frame(event: &[u8]) -> Result<BytesMut, DispatchError> {
        let len = u32::try_from(event.len())
            .map_err(|_| DispatchError::Rejected(format!("event too large: {} bytes", event.len())))?;
        let mut frame = BytesMut::with_capacity(4 + event.len());
        frame.put_u32(len);
        frame.put_slice(event);
        Ok(frame)
    }

    /// Write one framed event, reconnecting once if the write fails
    pub async fn send_bytes(&self, event: &[u8]) -> Result<(), DispatchError> {
        let frame = Self::frame(event)?;
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect_with_retry().await?);
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(()) => {
                    self.record_sent(event.len());
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "relay write failed, reconnecting");
                    *guard = None;
                }
            }
        }

        let mut stream = self.connect_with_retry().await?;
        stream.write_all(&frame).await?;
        *guard = Some(stream);
        self.record_sent(event.len());
        Ok(())
    }

    fn record_sent(&self, len: usize) {
        let total = self.messages_sent.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(total, bytes = len, "sent event to relay");
    }

    /// Get statistics
    pub async fn stats(&self) -> RelayDispatcherStats {
        RelayDispatcherStats {
            connected: self.stream.lock().await.is_some(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            socket_path: self.socket_path.clone(),
        }
    }
}

#[async_trait]
impl Dispatch for RelayDispatcher {
    async fn dispatch(&self, event: Vec<u8>, _options: DispatchOptions) -> Result<(), DispatchError> {
        self.send_bytes(&event).await
    }
}

/// Statistics for the relay dispatcher
#[derive(Debug, Clone)]
pub struct RelayDispatcherStats {
    /// Whether the relay is currently connected
    pub connected: bool,
    /// Total events written
    pub messages_sent: u64,
    /// Unix socket path
    pub socket_path: PathBuf,
}
