//! Configuration Hot Reload
//!
//! Polls the configuration file's modification time and broadcasts a
//! change event when it moves. The composition root subscribes and turns
//! each event into a gateway reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::sync::RwLock;

/// Configuration change event.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: PathBuf,
}

/// Watches one configuration file for modifications.
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Arc<RwLock<Option<SystemTime>>>,
    change_tx: broadcast::Sender<ConfigChange>,
    poll_interval: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl AsRef<Path>, poll_interval: Duration) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: path.as_ref().to_path_buf(),
            last_mtime: Arc::new(RwLock::new(None)),
            change_tx,
            poll_interval,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Record the current mtime as the baseline so the first poll does not
    /// fire for the file we just loaded.
    pub async fn prime(&self) {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        *self.last_mtime.write().await = mtime;
    }

    async fn check(&self) -> bool {
        let mtime = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            // A transiently missing file (editor save dance) is not a change.
            Err(_) => return false,
        };

        let mut last = self.last_mtime.write().await;
        match *last {
            Some(previous) if mtime <= previous => false,
            _ => {
                *last = Some(mtime);
                true
            }
        }
    }

    /// Start the polling loop.
    pub fn start(self: Arc<Self>) {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.poll_interval);
            // The first tick fires immediately; skip it so priming holds.
            interval.tick().await;

            loop {
                interval.tick().await;
                if watcher.check().await {
                    tracing::info!(path = ?watcher.path, "configuration file modified");
                    let _ = watcher.change_tx.send(ConfigChange {
                        path: watcher.path.clone(),
                    });
                }
            }
        });
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
