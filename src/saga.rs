//! The provisioning saga.
//!
//! Owns the deployment lifecycle and sequences the collaborators:
//! allocator -> builder -> edge router. Each step reports success or
//! failure as a value — nothing throws across a stage boundary — and
//! every failure becomes a state transition plus a log entry. Rollback
//! is the full teardown, executed in reverse dependency order and
//! tolerant of any resource that was never created.
//!
//! One deliberate asymmetry, kept from the observed behavior: a build
//! or run failure does NOT release the deployment's port. The port
//! stays owned by the `Failed` record until an explicit delete runs the
//! teardown path.

use std::sync::Arc;

use crate::builder::Builder;
use crate::edge::EdgeRouter;
use crate::logs::LogSink;
use crate::model::{DeploymentId, DeploymentState};
use crate::ports::PortAllocator;
use crate::store::StateStore;

pub struct DeploymentSaga {
    store: Arc<StateStore>,
    logs: LogSink,
    ports: PortAllocator,
    builder: Arc<dyn Builder>,
    edge: Arc<dyn EdgeRouter>,
}

impl DeploymentSaga {
    pub fn new(
        store: Arc<StateStore>,
        logs: LogSink,
        ports: PortAllocator,
        builder: Arc<dyn Builder>,
        edge: Arc<dyn EdgeRouter>,
    ) -> Self {
        Self {
            store,
            logs,
            ports,
            builder,
            edge,
        }
    }

    async fn transition(&self, id: DeploymentId, state: DeploymentState) {
        match self.store.update_deployment(id, |d| d.state = state).await {
            Ok(true) => {}
            Ok(false) => log::warn!("Deployment {id} disappeared during transition to {state}"),
            Err(e) => log::error!("Failed to persist state {state} for {id}: {e}"),
        }
    }

    /// Drive a `Pending` deployment to `Running` or `Failed`. Spawned as
    /// a background task; progress is observable through the state and
    /// log queries only.
    pub async fn provision(&self, id: DeploymentId) {
        let Some(deployment) = self.store.get_deployment(id).await else {
            log::warn!("Deployment {id} vanished before provisioning started");
            return;
        };
        self.transition(id, DeploymentState::Building).await;

        let workdir = match self.builder.fetch_source(id, &deployment.source_url).await {
            Ok(workdir) => workdir,
            Err(e) => {
                // Nothing besides the port exists yet; the fetch cleans
                // its own partial checkout.
                self.logs.error(id, format!("Failed to fetch source: {e}")).await;
                self.transition(id, DeploymentState::Failed).await;
                return;
            }
        };

        let image = match self
            .builder
            .package(id, &workdir, &deployment.name, deployment.port)
            .await
        {
            Ok(image) => image,
            Err(e) => {
                self.logs.error(id, format!("Build failed: {e}")).await;
                self.builder.discard_source(&workdir).await;
                self.transition(id, DeploymentState::Failed).await;
                return;
            }
        };

        let instance = match self
            .builder
            .run(id, &image, &deployment.name, deployment.port, &deployment.env_vars)
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                self.logs
                    .error(id, format!("Failed to start deployment: {e}"))
                    .await;
                self.builder.discard_source(&workdir).await;
                self.builder.destroy_image(&image).await;
                self.transition(id, DeploymentState::Failed).await;
                return;
            }
        };
        self.builder.discard_source(&workdir).await;

        match self
            .store
            .update_deployment(id, |d| {
                d.container_id = Some(instance.clone());
                d.image_tag = Some(image.clone());
                d.state = DeploymentState::Running;
            })
            .await
        {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                log::error!("Failed to record running instance for {id}");
            }
        }
        self.logs.info(id, "Deployment completed successfully").await;

        let wired = self.edge.wire(id, &deployment.subdomain, deployment.port).await;
        if !wired.proxy_ok {
            self.logs
                .error(id, "Reverse proxy wiring failed, tearing the deployment down")
                .await;
            self.teardown(id).await;
            return;
        }
        if !wired.edge_ok {
            self.logs
                .warning(
                    id,
                    "Edge wiring failed, deployment stays reachable through the proxy",
                )
                .await;
        }
    }

    /// Full teardown, for explicit deletes and for rolling back a
    /// deployment whose proxy wiring failed. Every sub-step runs even
    /// if an earlier one failed; the record is removed regardless, the
    /// log trail is kept. Returns the AND of every sub-step, and calling
    /// it again after everything is gone is a silent success.
    pub async fn teardown(&self, id: DeploymentId) -> bool {
        let Some(deployment) = self.store.get_deployment(id).await else {
            log::info!("Deployment {id} has no record, nothing to tear down");
            return true;
        };
        self.logs
            .info(id, format!("Starting teardown for {}", deployment.name))
            .await;
        let mut ok = true;

        if let Some(instance) = &deployment.container_id {
            self.logs.info(id, "Stopping container").await;
            if self.builder.stop_instance(instance).await {
                self.logs.info(id, "Container stopped").await;
            } else {
                self.logs.error(id, "Failed to stop container").await;
                ok = false;
            }
            if self.builder.destroy_instance(instance).await {
                self.logs.info(id, "Container removed").await;
            } else {
                self.logs.error(id, "Failed to remove container").await;
                ok = false;
            }
        }

        if let Some(image) = &deployment.image_tag {
            if self.builder.destroy_image(image).await {
                self.logs.info(id, "Image removed").await;
            } else {
                self.logs.error(id, "Failed to remove image").await;
                ok = false;
            }
        }

        if self.edge.unwire(id, &deployment.subdomain).await {
            self.logs.info(id, "Edge routing removed").await;
        } else {
            self.logs.error(id, "Failed to fully unwire edge routing").await;
            ok = false;
        }

        self.logs
            .info(id, format!("Releasing port {}", deployment.port))
            .await;
        if !self.ports.release(deployment.port).await {
            self.logs
                .error(id, format!("Failed to release port {}", deployment.port))
                .await;
            ok = false;
        }

        match self.store.remove_deployment(id).await {
            Ok(_) => {
                self.logs.info(id, "Deployment record removed").await;
            }
            Err(e) => {
                self.logs
                    .error(id, format!("Failed to remove deployment record: {e}"))
                    .await;
                ok = false;
            }
        }

        if ok {
            self.logs.info(id, "Teardown completed").await;
        } else {
            self.logs
                .warning(
                    id,
                    format!(
                        "{}, record removed anyway",
                        crate::error::ProvisionError::TeardownPartialFailure
                    ),
                )
                .await;
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use crate::model::{Deployment, LogLevel};
    use crate::store::tests::scratch_path;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FailPoint {
        Fetch,
        Package,
        Run,
    }

    #[derive(Default)]
    struct FakeBuilder {
        fail: Option<FailPoint>,
        stopped: Mutex<Vec<String>>,
        destroyed_instances: Mutex<Vec<String>>,
        destroyed_images: Mutex<Vec<String>>,
        discarded: AtomicUsize,
    }

    impl FakeBuilder {
        fn failing_at(fail: FailPoint) -> Self {
            Self {
                fail: Some(fail),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Builder for FakeBuilder {
        async fn fetch_source(
            &self,
            _id: DeploymentId,
            _source_url: &str,
        ) -> Result<PathBuf, ProvisionError> {
            if self.fail == Some(FailPoint::Fetch) {
                return Err(ProvisionError::SourceUnavailable(
                    "could not reach repository".to_string(),
                ));
            }
            Ok(std::env::temp_dir().join("slipway-fake-src"))
        }

        async fn package(
            &self,
            _id: DeploymentId,
            _workdir: &Path,
            name: &str,
            _port: u16,
        ) -> Result<String, ProvisionError> {
            if self.fail == Some(FailPoint::Package) {
                return Err(ProvisionError::BuildFailed("compiler exploded".to_string()));
            }
            Ok(format!("{name}:fake"))
        }

        async fn run(
            &self,
            _id: DeploymentId,
            _image: &str,
            _name: &str,
            _port: u16,
            _env: &HashMap<String, String>,
        ) -> Result<String, ProvisionError> {
            if self.fail == Some(FailPoint::Run) {
                return Err(ProvisionError::RunFailed("entrypoint crashed".to_string()));
            }
            Ok("container-1".to_string())
        }

        async fn stop_instance(&self, instance: &str) -> bool {
            self.stopped.lock().unwrap().push(instance.to_string());
            true
        }

        async fn destroy_instance(&self, instance: &str) -> bool {
            self.destroyed_instances
                .lock()
                .unwrap()
                .push(instance.to_string());
            true
        }

        async fn destroy_image(&self, image: &str) -> bool {
            self.destroyed_images.lock().unwrap().push(image.to_string());
            true
        }

        async fn discard_source(&self, _workdir: &Path) -> bool {
            self.discarded.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct FakeEdge {
        proxy_ok: bool,
        edge_ok: bool,
        unwires: AtomicUsize,
    }

    impl FakeEdge {
        fn healthy() -> Self {
            Self {
                proxy_ok: true,
                edge_ok: true,
                unwires: AtomicUsize::new(0),
            }
        }
        fn with(proxy_ok: bool, edge_ok: bool) -> Self {
            Self {
                proxy_ok,
                edge_ok,
                unwires: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EdgeRouter for FakeEdge {
        async fn wire(
            &self,
            _id: DeploymentId,
            _subdomain: &str,
            _port: u16,
        ) -> crate::edge::WireResult {
            crate::edge::WireResult {
                proxy_ok: self.proxy_ok,
                edge_ok: self.proxy_ok && self.edge_ok,
            }
        }

        async fn unwire(&self, _id: DeploymentId, _subdomain: &str) -> bool {
            self.unwires.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct Rig {
        saga: DeploymentSaga,
        store: Arc<StateStore>,
        builder: Arc<FakeBuilder>,
        edge: Arc<FakeEdge>,
        id: DeploymentId,
        path: PathBuf,
    }

    async fn rig(tag: &str, builder: FakeBuilder, edge: FakeEdge) -> Rig {
        let path = scratch_path(tag);
        let store = Arc::new(StateStore::open(&path).await.unwrap());
        let logs = LogSink::new(store.clone());
        let ports = PortAllocator::new(store.clone(), 3000, 3010);
        let builder = Arc::new(builder);
        let edge = Arc::new(edge);

        let id = DeploymentId::new();
        let port = ports.allocate(id).await.unwrap();
        store
            .insert_deployment(Deployment::new(
                id,
                "demo".to_string(),
                "https://example.com/demo.git".to_string(),
                "demo".to_string(),
                port,
                HashMap::new(),
            ))
            .await
            .unwrap();

        let builder_dyn: Arc<dyn Builder> = builder.clone();
        let edge_dyn: Arc<dyn EdgeRouter> = edge.clone();
        let saga = DeploymentSaga::new(store.clone(), logs, ports, builder_dyn, edge_dyn);
        Rig {
            saga,
            store,
            builder,
            edge,
            id,
            path,
        }
    }

    fn errors(entries: &[crate::model::BuildLogEntry]) -> Vec<&str> {
        entries
            .iter()
            .filter(|e| e.level == LogLevel::Error)
            .map(|e| e.message.as_str())
            .collect()
    }

    #[tokio::test]
    async fn happy_path_reaches_running_with_handles() {
        let rig = rig("happy", FakeBuilder::default(), FakeEdge::healthy()).await;
        rig.saga.provision(rig.id).await;

        let deployment = rig.store.get_deployment(rig.id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Running);
        assert_eq!(deployment.container_id.as_deref(), Some("container-1"));
        assert_eq!(deployment.image_tag.as_deref(), Some("demo:fake"));
        assert_eq!(rig.builder.discarded.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_file(&rig.path);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_the_port_and_logs_one_error() {
        let rig = rig(
            "fetch-fail",
            FakeBuilder::failing_at(FailPoint::Fetch),
            FakeEdge::healthy(),
        )
        .await;
        rig.saga.provision(rig.id).await;

        let deployment = rig.store.get_deployment(rig.id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Failed);
        assert!(deployment.container_id.is_none());
        assert!(deployment.image_tag.is_none());

        // The failed deployment still owns its port.
        let record = rig.store.port_record(deployment.port).await.unwrap();
        assert!(record.allocated);
        assert_eq!(record.owner, Some(rig.id));

        let entries = rig.store.logs_for(rig.id).await;
        let errors = errors(&entries);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("source"));
        let _ = std::fs::remove_file(&rig.path);
    }

    #[tokio::test]
    async fn run_failure_cleans_artifacts_but_not_the_port() {
        let rig = rig(
            "run-fail",
            FakeBuilder::failing_at(FailPoint::Run),
            FakeEdge::healthy(),
        )
        .await;
        rig.saga.provision(rig.id).await;

        let deployment = rig.store.get_deployment(rig.id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Failed);
        assert!(deployment.container_id.is_none());
        assert!(deployment.image_tag.is_none());
        assert!(rig.store.port_record(deployment.port).await.unwrap().allocated);

        // Build artifacts were cleaned up best-effort.
        assert_eq!(rig.builder.discarded.load(Ordering::SeqCst), 1);
        assert_eq!(
            rig.builder.destroyed_images.lock().unwrap().as_slice(),
            ["demo:fake"]
        );
        let _ = std::fs::remove_file(&rig.path);
    }

    #[tokio::test]
    async fn proxy_failure_rolls_everything_back() {
        let rig = rig(
            "proxy-fail",
            FakeBuilder::default(),
            FakeEdge::with(false, false),
        )
        .await;
        let port = rig.store.get_deployment(rig.id).await.unwrap().port;
        rig.saga.provision(rig.id).await;

        // The deployment does not remain half-running: record deleted,
        // port released, container and image destroyed.
        assert!(rig.store.get_deployment(rig.id).await.is_none());
        assert!(!rig.store.port_record(port).await.unwrap().allocated);
        assert_eq!(
            rig.builder.stopped.lock().unwrap().as_slice(),
            ["container-1"]
        );
        assert_eq!(
            rig.builder.destroyed_instances.lock().unwrap().as_slice(),
            ["container-1"]
        );
        assert_eq!(rig.edge.unwires.load(Ordering::SeqCst), 1);
        // The trail survives the record.
        assert!(!rig.store.logs_for(rig.id).await.is_empty());
        let _ = std::fs::remove_file(&rig.path);
    }

    #[tokio::test]
    async fn edge_failure_is_degraded_success() {
        let rig = rig(
            "edge-degraded",
            FakeBuilder::default(),
            FakeEdge::with(true, false),
        )
        .await;
        rig.saga.provision(rig.id).await;

        let deployment = rig.store.get_deployment(rig.id).await.unwrap();
        assert_eq!(deployment.state, DeploymentState::Running);
        let entries = rig.store.logs_for(rig.id).await;
        assert!(
            entries
                .iter()
                .any(|e| e.level == LogLevel::Warning && e.message.contains("proxy"))
        );
        assert!(errors(&entries).is_empty());
        let _ = std::fs::remove_file(&rig.path);
    }

    #[tokio::test]
    async fn teardown_is_complete_and_idempotent() {
        let rig = rig("teardown", FakeBuilder::default(), FakeEdge::healthy()).await;
        let port = rig.store.get_deployment(rig.id).await.unwrap().port;
        rig.saga.provision(rig.id).await;

        assert!(rig.saga.teardown(rig.id).await);
        assert!(rig.store.get_deployment(rig.id).await.is_none());
        assert!(!rig.store.port_record(port).await.unwrap().allocated);
        assert_eq!(rig.builder.stopped.lock().unwrap().len(), 1);
        let trail_len = rig.store.logs_for(rig.id).await.len();
        assert!(trail_len > 0);

        // Second run: everything is already gone, all no-ops, no new
        // side effects on the collaborators.
        assert!(rig.saga.teardown(rig.id).await);
        assert_eq!(rig.builder.stopped.lock().unwrap().len(), 1);
        assert_eq!(rig.edge.unwires.load(Ordering::SeqCst), 1);
        assert_eq!(rig.store.logs_for(rig.id).await.len(), trail_len);
        let _ = std::fs::remove_file(&rig.path);
    }

    #[tokio::test]
    async fn teardown_of_a_never_built_deployment_is_quiet() {
        let rig = rig(
            "teardown-early",
            FakeBuilder::failing_at(FailPoint::Fetch),
            FakeEdge::healthy(),
        )
        .await;
        let port = rig.store.get_deployment(rig.id).await.unwrap().port;
        rig.saga.provision(rig.id).await;

        // Failed at fetch: no container, no image, nothing wired.
        assert!(rig.saga.teardown(rig.id).await);
        assert!(rig.store.get_deployment(rig.id).await.is_none());
        assert!(!rig.store.port_record(port).await.unwrap().allocated);
        assert!(rig.builder.stopped.lock().unwrap().is_empty());
        assert!(rig.builder.destroyed_images.lock().unwrap().is_empty());
        let _ = std::fs::remove_file(&rig.path);
    }
}
