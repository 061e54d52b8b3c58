//! Adapter lifecycle state machine
//!
//! ```text
//! Created -> Connecting -> Subscribed -> Unsubscribing -> Stopped
//!                 |                                          ^
//!                 +------------------------------------------+
//! ```
//!
//! Per-message `Normalizing -> Dispatching` happens inside `Subscribed` and is
//! not tracked as a separate state. The [`MessageGate`] is what handlers
//! consult before dispatching: it is open only while `Subscribed`. It stops
//! admitting and drains in-flight dispatches before `Unsubscribing` is
//! published, so none can start after that state is observed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tracing::{debug, warn};

/// Running state of one adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Built, never started
    Created,
    /// Resolving secrets, connecting, subscribing
    Connecting,
    /// Listening; the only state in which messages are dispatched
    Subscribed,
    /// Cancellation received, tearing down
    Unsubscribing,
    /// Terminal
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Subscribed => "subscribed",
            LifecycleState::Unsubscribing => "unsubscribing",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Admission control for message handlers
#[derive(Debug, Default)]
pub struct MessageGate {
    accepting: AtomicBool,
    in_flight: RwLock<()>,
}

/// Held by a handler for the duration of one dispatch
pub type GatePermit<'a> = RwLockReadGuard<'a, ()>;

impl MessageGate {
    /// Closed gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a message, or `None` if the gate is closed
    ///
    /// Hold the permit for the whole dispatch.
    pub async fn enter(&self) -> Option<GatePermit<'_>> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        let permit = self.in_flight.read().await;
        // closed while waiting for the lock
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }
        Some(permit)
    }

    /// Start admitting messages
    pub fn open(&self) {
        self.accepting.store(true, Ordering::Release);
    }

    /// Stop admitting messages; permits already handed out stay valid
    pub fn stop_admitting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Wait up to `timeout` for every outstanding permit to be released
    ///
    /// Returns `false` if in-flight dispatches were still running when the
    /// timeout elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.in_flight.write())
            .await
            .is_ok()
    }

    /// Stop admitting messages and wait up to `timeout` for in-flight dispatches
    ///
    /// No dispatch is admitted after this is called.
    pub async fn close(&self, timeout: Duration) -> bool {
        self.stop_admitting();
        self.drain(timeout).await
    }

    /// Whether messages are currently admitted
    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

/// Owns the state of one adapter instance
#[derive(Debug)]
pub struct LifecycleController {
    started: AtomicBool,
    state: watch::Sender<LifecycleState>,
    gate: MessageGate,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    /// Controller in `Created`
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            started: AtomicBool::new(false),
            state,
            gate: MessageGate::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Stream of state transitions
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Gate consulted by message handlers
    pub fn gate(&self) -> &MessageGate {
        &self.gate
    }

    /// `Created -> Connecting`; returns `false` if this instance already started
    pub fn begin(&self) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.transition(LifecycleState::Connecting);
        true
    }

    /// `Connecting -> Subscribed`; opens the gate first so the first message is not lost
    pub fn subscribed(&self) {
        self.gate.open();
        self.transition(LifecycleState::Subscribed);
    }

    /// `Subscribed -> Unsubscribing`; closes the gate, bounded by `drain_timeout`
    ///
    /// The gate stops admitting and in-flight dispatches drain before the new
    /// state is published, so no dispatch starts once `Unsubscribing` is
    /// observable.
    pub async fn unsubscribing(&self, drain_timeout: Duration) {
        self.gate.stop_admitting();
        if !self.gate.drain(drain_timeout).await {
            warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                "in-flight dispatches did not finish before teardown"
            );
        }
        self.transition(LifecycleState::Unsubscribing);
    }

    /// Any state `-> Stopped`
    pub fn stopped(&self) {
        self.transition(LifecycleState::Stopped);
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        debug!(from = %previous, to = %next, "lifecycle transition");
    }
}
