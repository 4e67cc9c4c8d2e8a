//! Persisted state.
//!
//! Three collections — deployments, port records, log entries — held in
//! memory behind one lock and snapshotted to a JSON file on every
//! mutation (write to a temp file, then rename over the old snapshot).
//! The collections relate only by identifiers; removing a deployment
//! leaves its log entries untouched.
//!
//! Port allocation lives here rather than in the allocator because it
//! must be a single conditional update: the scan for a free record and
//! the mark-as-allocated happen inside one write-lock critical section
//! and are persisted before the lock drops. Two tasks can never observe
//! the same port as free.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::model::{BuildLogEntry, Deployment, DeploymentId, DeploymentState, PortRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collections {
    deployments: HashMap<DeploymentId, Deployment>,
    ports: BTreeMap<u16, PortRecord>,
    logs: Vec<BuildLogEntry>,
}

pub struct StateStore {
    path: PathBuf,
    inner: RwLock<Collections>,
}

impl StateStore {
    /// Open the store at `path`, loading the previous snapshot if one
    /// exists.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let collections = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(std::io::Error::other)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collections::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            inner: RwLock::new(collections),
        })
    }

    async fn persist(&self, inner: &Collections) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(inner).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    // ---- deployments ----

    pub async fn insert_deployment(&self, deployment: Deployment) -> std::io::Result<()> {
        let mut inner = self.inner.write().await;
        inner.deployments.insert(deployment.id, deployment);
        self.persist(&inner).await
    }

    pub async fn get_deployment(&self, id: DeploymentId) -> Option<Deployment> {
        self.inner.read().await.deployments.get(&id).cloned()
    }

    pub async fn list_deployments(&self) -> Vec<Deployment> {
        let inner = self.inner.read().await;
        let mut all: Vec<_> = inner.deployments.values().cloned().collect();
        all.sort_by_key(|d| d.created_at);
        all
    }

    /// Apply `mutate` to the deployment if it exists, stamping
    /// `updated_at`. Returns whether the record was found.
    pub async fn update_deployment(
        &self,
        id: DeploymentId,
        mutate: impl FnOnce(&mut Deployment),
    ) -> std::io::Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(deployment) = inner.deployments.get_mut(&id) else {
            return Ok(false);
        };
        mutate(deployment);
        deployment.updated_at = Utc::now();
        self.persist(&inner).await?;
        Ok(true)
    }

    /// Remove the deployment record. Its log entries stay.
    pub async fn remove_deployment(&self, id: DeploymentId) -> std::io::Result<Option<Deployment>> {
        let mut inner = self.inner.write().await;
        let removed = inner.deployments.remove(&id);
        if removed.is_some() {
            self.persist(&inner).await?;
        }
        Ok(removed)
    }

    /// Whether `subdomain` is held by a deployment that is not `Failed`.
    pub async fn subdomain_in_use(&self, subdomain: &str) -> bool {
        self.inner
            .read()
            .await
            .deployments
            .values()
            .any(|d| d.subdomain == subdomain && d.state != DeploymentState::Failed)
    }

    // ---- port records ----

    /// Atomically claim the lowest free port in `[min, max]` for
    /// `owner`. Records are created lazily the first time a port is
    /// visited. Returns `None` when every port in range is allocated.
    pub async fn allocate_first_free(
        &self,
        min: u16,
        max: u16,
        owner: DeploymentId,
    ) -> std::io::Result<Option<u16>> {
        let mut inner = self.inner.write().await;
        let mut claimed = None;
        for port in min..=max {
            let record = inner.ports.entry(port).or_insert_with(|| PortRecord {
                port,
                allocated: false,
                owner: None,
                allocated_at: None,
                released_at: None,
            });
            if !record.allocated {
                record.allocated = true;
                record.owner = Some(owner);
                record.allocated_at = Some(Utc::now());
                claimed = Some(port);
                break;
            }
        }
        if claimed.is_some() {
            self.persist(&inner).await?;
        }
        Ok(claimed)
    }

    /// Mark `port` free. A port that is already free (or was never
    /// touched) is a no-op. Returns whether the record actually toggled.
    pub async fn release_port(&self, port: u16) -> std::io::Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.ports.get_mut(&port) else {
            return Ok(false);
        };
        if !record.allocated {
            return Ok(false);
        }
        record.allocated = false;
        record.owner = None;
        record.released_at = Some(Utc::now());
        self.persist(&inner).await?;
        Ok(true)
    }

    /// Advisory read of a port's allocation state; may be stale the
    /// instant it returns.
    pub async fn port_available(&self, port: u16) -> bool {
        self.inner
            .read()
            .await
            .ports
            .get(&port)
            .is_none_or(|r| !r.allocated)
    }

    pub async fn port_record(&self, port: u16) -> Option<PortRecord> {
        self.inner.read().await.ports.get(&port).cloned()
    }

    // ---- log entries ----

    pub async fn append_log(&self, entry: BuildLogEntry) -> std::io::Result<()> {
        let mut inner = self.inner.write().await;
        inner.logs.push(entry);
        self.persist(&inner).await
    }

    /// All entries for a deployment, ordered by timestamp.
    pub async fn logs_for(&self, id: DeploymentId) -> Vec<BuildLogEntry> {
        let inner = self.inner.read().await;
        let mut entries: Vec<_> = inner
            .logs
            .iter()
            .filter(|e| e.deployment_id == id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }
}
