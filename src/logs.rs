//! Per-deployment event log.
//!
//! Append-only, timestamped, leveled entries written by every component
//! of a provisioning run. Entries are mirrored onto the process log at
//! the matching level so `RUST_LOG` output and the persisted trail tell
//! the same story.

use std::sync::Arc;

use crate::model::{BuildLogEntry, DeploymentId, LogLevel};
use crate::store::StateStore;

#[derive(Clone)]
pub struct LogSink {
    store: Arc<StateStore>,
}

impl LogSink {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub async fn append(&self, id: DeploymentId, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => log::info!("[{id}] {message}"),
            LogLevel::Warning => log::warn!("[{id}] {message}"),
            LogLevel::Error => log::error!("[{id}] {message}"),
            LogLevel::Debug => log::debug!("[{id}] {message}"),
        }
        let entry = BuildLogEntry::new(id, level, message);
        if let Err(e) = self.store.append_log(entry).await {
            log::error!("Failed to persist log entry for {id}: {e}");
        }
    }

    pub async fn info(&self, id: DeploymentId, message: impl Into<String>) {
        self.append(id, LogLevel::Info, message).await;
    }

    pub async fn warning(&self, id: DeploymentId, message: impl Into<String>) {
        self.append(id, LogLevel::Warning, message).await;
    }

    pub async fn error(&self, id: DeploymentId, message: impl Into<String>) {
        self.append(id, LogLevel::Error, message).await;
    }

    /// The deployment's trail in timestamp order.
    pub async fn entries(&self, id: DeploymentId) -> Vec<BuildLogEntry> {
        self.store.logs_for(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::scratch_path;

    #[tokio::test]
    async fn entries_come_back_in_order() {
        let path = scratch_path("sink");
        let store = Arc::new(StateStore::open(&path).await.unwrap());
        let sink = LogSink::new(store);
        let id = DeploymentId::new();
        sink.info(id, "first").await;
        sink.warning(id, "second").await;
        sink.error(id, "third").await;
        let entries = sink.entries(id).await;
        let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(entries[1].level, LogLevel::Warning);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn trails_are_isolated_per_deployment() {
        let path = scratch_path("sink-iso");
        let store = Arc::new(StateStore::open(&path).await.unwrap());
        let sink = LogSink::new(store);
        let a = DeploymentId::new();
        let b = DeploymentId::new();
        sink.info(a, "for a").await;
        sink.info(b, "for b").await;
        assert_eq!(sink.entries(a).await.len(), 1);
        assert_eq!(sink.entries(b).await.len(), 1);
    }
}
