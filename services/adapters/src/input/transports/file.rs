//! Polling file watcher
//!
//! The watched directory is scanned every `poll_interval`. Consecutive scans
//! are compared per file name:
//!
//! - new name: `create`
//! - name gone: `remove`, or `rename` when its inode shows up under a new name
//! - size or mtime changed: `write`
//! - permission bits changed: `chmod`
//!
//! Only changes of the configured operation on files selected by the path
//! matcher become messages. Each message's topic is the full file path and
//! its payload is `{"name":"<full path>","op":"<operation>"}`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use types::{ConfigError, FileOperation, FileWatchConfig, PathMatcher};

use crate::error::{SecretError, TransportError};
use crate::input::subscription::{
    ChannelSpec, InboundMessage, MessageHandler, SourceTransport, SubscriptionHandle,
};

/// One filesystem change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// Full path of the file
    pub name: String,
    /// What happened to it
    pub op: FileOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    len: u64,
    modified: Option<SystemTime>,
    inode: u64,
    mode: u32,
}

impl FileState {
    #[cfg(unix)]
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            inode: metadata.ino(),
            mode: metadata.mode(),
        }
    }

    #[cfg(not(unix))]
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            inode: 0,
            mode: u32::from(metadata.permissions().readonly()),
        }
    }
}

type Snapshot = HashMap<String, FileState>;

async fn scan(directory: &Path) -> std::io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    let mut entries = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = entries.next_entry().await? {
        // entries can vanish between listing and stat
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if metadata.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            snapshot.insert(name.to_string(), FileState::from_metadata(&metadata));
        }
    }
    Ok(snapshot)
}

/// Changes between two scans as `(file name, operation)`, sorted by name
fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<(String, FileOperation)> {
    let mut changes = Vec::new();

    let created: Vec<(&String, &FileState)> = current
        .iter()
        .filter(|(name, _)| !previous.contains_key(*name))
        .collect();

    for (name, old) in previous {
        match current.get(name) {
            Some(new) => {
                if new.len != old.len || new.modified != old.modified {
                    changes.push((name.clone(), FileOperation::Write));
                }
                if new.mode != old.mode {
                    changes.push((name.clone(), FileOperation::Chmod));
                }
            }
            None => {
                let renamed = old.inode != 0 && created.iter().any(|(_, s)| s.inode == old.inode);
                let op = if renamed {
                    FileOperation::Rename
                } else {
                    FileOperation::Remove
                };
                changes.push((name.clone(), op));
            }
        }
    }

    for (name, _) in created {
        changes.push((name.clone(), FileOperation::Create));
    }

    changes.sort();
    changes
}

/// Live watch on a directory
pub struct FileWatchConnection {
    directory: PathBuf,
    tasks: DashMap<u64, JoinHandle<()>>,
}

/// Directory watch transport
pub struct FileTransport {
    config: FileWatchConfig,
    matcher: Arc<PathMatcher>,
    next_id: AtomicU64,
}

impl FileTransport {
    /// Transport for one watch block
    pub fn new(config: FileWatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let matcher = Arc::new(config.watch_path.matcher()?);
        Ok(Self {
            config,
            matcher,
            next_id: AtomicU64::new(1),
        })
    }

    /// Watch configuration
    pub fn config(&self) -> &FileWatchConfig {
        &self.config
    }
}

#[async_trait]
impl SourceTransport for FileTransport {
    type Settings = ();
    type Connection = FileWatchConnection;

    fn address(&self) -> String {
        self.config.watch_path.directory.clone()
    }

    async fn prepare(&self) -> Result<(), SecretError> {
        Ok(())
    }

    async fn connect(&self, _settings: &()) -> Result<FileWatchConnection, TransportError> {
        let directory = PathBuf::from(&self.config.watch_path.directory);
        let metadata = tokio::fs::metadata(&directory).await?;
        if !metadata.is_dir() {
            return Err(TransportError::InvalidAddress {
                address: directory.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(FileWatchConnection {
            directory,
            tasks: DashMap::new(),
        })
    }

    async fn subscribe(
        &self,
        connection: &FileWatchConnection,
        channel: &ChannelSpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let directory = connection.directory.clone();
        let mut previous = scan(&directory).await?;
        let matcher = self.matcher.clone();
        let wanted = self.config.op;

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let task = tokio::spawn(async move {
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let current = match scan(&directory).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(directory = %directory.display(), error = %e, "failed to scan watched directory");
                        continue;
                    }
                };

                for (name, op) in diff(&previous, &current) {
                    if op != wanted || !matcher.matches(&name) {
                        continue;
                    }
                    let path = directory.join(&name).display().to_string();
                    let event = FileEvent {
                        name: path.clone(),
                        op,
                    };
                    match serde_json::to_vec(&event) {
                        Ok(payload) => handler.on_message(InboundMessage::new(path, payload)).await,
                        Err(e) => warn!(error = %e, "failed to encode file event"),
                    }
                }
                previous = current;
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        connection.tasks.insert(id, task);
        debug!(directory = %connection.directory.display(), id, "watching directory");

        Ok(SubscriptionHandle {
            id,
            channel: channel.clone(),
        })
    }

    async fn unsubscribe(
        &self,
        connection: &FileWatchConnection,
        handle: SubscriptionHandle,
    ) -> Result<(), TransportError> {
        if let Some((_, task)) = connection.tasks.remove(&handle.id) {
            task.abort();
        }
        Ok(())
    }

    async fn close(&self, connection: FileWatchConnection) {
        for entry in connection.tasks.iter() {
            entry.value().abort();
        }
    }
}
