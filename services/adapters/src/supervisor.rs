//! Supervised adapter runs
//!
//! [`supervise`] runs `start_listening` on its own Tokio task so a panic in
//! the adapter is reported as [`SupervisedExit::Panicked`] instead of taking
//! the owner down.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::AdapterError;
use crate::input::EventSource;
use crate::output::Dispatch;

/// How a supervised run ended
#[derive(Debug)]
pub enum SupervisedExit {
    /// Stopped after cancellation
    Completed,
    /// Returned an error
    Failed(AdapterError),
    /// Panicked; carries the panic message when it was a string
    Panicked(String),
}

impl SupervisedExit {
    /// Whether the run ended cleanly
    pub fn is_success(&self) -> bool {
        matches!(self, SupervisedExit::Completed)
    }
}

/// Spawn `source` and report how it ended
pub fn supervise(
    source: Arc<dyn EventSource>,
    shutdown: broadcast::Receiver<()>,
    dispatch: Arc<dyn Dispatch>,
) -> JoinHandle<SupervisedExit> {
    tokio::spawn(async move {
        let event_source_name = source.event_source_name().to_string();
        let event_name = source.event_name().to_string();

        let run = {
            let source = source.clone();
            tokio::spawn(async move { source.start_listening(shutdown, dispatch).await })
        };

        match run.await {
            Ok(Ok(())) => {
                info!(%event_source_name, %event_name, "event source exited");
                SupervisedExit::Completed
            }
            Ok(Err(e)) => SupervisedExit::Failed(e),
            Err(join_error) if join_error.is_panic() => {
                let payload = join_error.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%event_source_name, %event_name, panic = %message, "event source panicked");
                SupervisedExit::Panicked(message)
            }
            Err(join_error) => {
                error!(%event_source_name, %event_name, error = %join_error, "event source task cancelled");
                SupervisedExit::Panicked(join_error.to_string())
            }
        }
    })
}
