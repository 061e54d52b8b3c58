//! # Event Source Types
//!
//! Shared data model for the event source adapters:
//!
//! - [`EventSourceDescriptor`]: immutable, validated configuration for one adapter
//! - [`ConnectionBackoffPolicy`]: retry parameters for the connection establisher
//! - [`FileWatchConfig`]: watch-path settings plus an operation filter
//! - [`NormalizedEvent`]: the canonical envelope handed to the dispatch pipeline
//!
//! Descriptors are read from YAML or JSON. Unknown fields are ignored; missing
//! required fields surface as [`ConfigError`] at parse time, never at runtime.
//!
//! ```rust
//! use types::{EventSourceDescriptor, EventSourceType};
//!
//! let descriptor = EventSourceDescriptor::from_yaml_str(
//!     "eventSourceName: demo\neventName: example\nbroker:\n  broker: ws://x\n  channelKey: k\n  channelName: c\n",
//! )?;
//! assert_eq!(descriptor.source_type(), EventSourceType::Broker);
//! # Ok::<(), types::ConfigError>(())
//! ```

pub mod descriptor;
pub mod duration;
pub mod errors;
pub mod event;
pub mod watch;

pub use descriptor::{
    BrokerEventSource, ConnectionBackoffPolicy, EventSourceDescriptor, EventSourceType,
    SecretRef, SourceConfig, TlsConfig,
};
pub use errors::ConfigError;
pub use event::{EventBody, NormalizedEvent};
pub use watch::{FileOperation, FileWatchConfig, PathMatcher, WatchPathConfig};
