//! Turning a source reference into a running container.
//!
//! The saga consumes this through the [`Builder`] trait: fetch the
//! source, package it into an image, run it on the allocated port, and
//! invert each of those steps. Every destructive operation treats an
//! absent target as success so a half-built deployment can always be
//! torn down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, ListContainersOptions,
    ListContainersOptionsBuilder, RemoveContainerOptions, RemoveContainerOptionsBuilder,
    RemoveImageOptions, RemoveImageOptionsBuilder, StartContainerOptions,
    StartContainerOptionsBuilder, StopContainerOptions, StopContainerOptionsBuilder,
};

use crate::error::ProvisionError;
use crate::logs::LogSink;
use crate::model::DeploymentId;

pub mod docker;
pub mod dockerfile;

use docker::get_docker;
use dockerfile::{detect_project_kind, render_dockerfile};

#[async_trait]
pub trait Builder: Send + Sync {
    /// Fetch the source tree for `source_url` into a fresh working
    /// directory.
    async fn fetch_source(
        &self,
        id: DeploymentId,
        source_url: &str,
    ) -> Result<PathBuf, ProvisionError>;

    /// Package the working tree into an image that listens on `port`.
    /// Returns the image reference.
    async fn package(
        &self,
        id: DeploymentId,
        workdir: &Path,
        name: &str,
        port: u16,
    ) -> Result<String, ProvisionError>;

    /// Start a container from `image`, publishing its listening port to
    /// `port` on the host and injecting `env` plus `PORT`. Returns the
    /// instance handle.
    async fn run(
        &self,
        id: DeploymentId,
        image: &str,
        name: &str,
        port: u16,
        env: &HashMap<String, String>,
    ) -> Result<String, ProvisionError>;

    async fn stop_instance(&self, instance: &str) -> bool;
    async fn destroy_instance(&self, instance: &str) -> bool;
    async fn destroy_image(&self, image: &str) -> bool;

    /// Drop a fetched working tree. Absent directories are a no-op.
    async fn discard_source(&self, workdir: &Path) -> bool;
}

/// Image tags must be lowercase alphanumerics with a few separators and
/// must not start with one of them.
pub fn sanitize_image_name(name: &str) -> String {
    let cleaned: String = name
        .to_lowercase()
        .replace(['_', ' '], "-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .collect();
    let cleaned = cleaned.trim_start_matches(['-', '.']).to_string();
    if cleaned.is_empty() {
        "deployment".to_string()
    } else {
        cleaned
    }
}

fn stderr_tail(output: &std::process::Output, lines: usize) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = text.lines().rev().take(lines).collect();
    tail.into_iter().rev().collect::<Vec<_>>().join("\n")
}

/// The real builder: git for fetching, the docker CLI for image builds,
/// the Docker API for container lifecycle.
pub struct DockerBuilder {
    logs: LogSink,
    clone_timeout: Duration,
    build_timeout: Duration,
    external_timeout: Duration,
}

impl DockerBuilder {
    pub fn new(
        logs: LogSink,
        clone_timeout: Duration,
        build_timeout: Duration,
        external_timeout: Duration,
    ) -> Self {
        Self {
            logs,
            clone_timeout,
            build_timeout,
            external_timeout,
        }
    }

    /// Stop and remove anything already publishing `port` on the host.
    /// Orphans from a crashed run would otherwise make `run` fail with
    /// a port conflict.
    async fn sweep_stale_instances(&self, id: DeploymentId, port: u16) {
        let docker = get_docker();
        let mut filters = HashMap::new();
        filters.insert("publish".to_string(), vec![port.to_string()]);
        let options: ListContainersOptions =
            ListContainersOptionsBuilder::new().filters(&filters).build();

        let stale = match docker.list_containers(Some(options)).await {
            Ok(containers) => containers,
            Err(e) => {
                log::warn!("Failed to scan for stale containers on port {port}: {e}");
                return;
            }
        };
        for container in stale {
            let Some(stale_id) = container.id else { continue };
            self.logs
                .warning(
                    id,
                    format!("Removing stale container {stale_id} already bound to port {port}"),
                )
                .await;
            let _ = self.stop_instance(&stale_id).await;
            let _ = self.destroy_instance(&stale_id).await;
        }
    }
}

#[async_trait]
impl Builder for DockerBuilder {
    async fn fetch_source(
        &self,
        id: DeploymentId,
        source_url: &str,
    ) -> Result<PathBuf, ProvisionError> {
        let workdir = std::env::temp_dir().join(format!("slipway-src-{id}"));
        let _ = tokio::fs::remove_dir_all(&workdir).await;

        self.logs
            .info(id, format!("Cloning repository: {source_url}"))
            .await;

        let mut clone = tokio::process::Command::new("git");
        clone
            .args(["clone", "--depth", "1", source_url])
            .arg(&workdir);
        let output = match tokio::time::timeout(self.clone_timeout, clone.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProvisionError::SourceUnavailable(format!(
                    "failed to run git: {e}"
                )));
            }
            Err(_) => {
                let _ = tokio::fs::remove_dir_all(&workdir).await;
                return Err(ProvisionError::SourceUnavailable(format!(
                    "clone timed out after {}s",
                    self.clone_timeout.as_secs()
                )));
            }
        };
        if !output.status.success() {
            let _ = tokio::fs::remove_dir_all(&workdir).await;
            return Err(ProvisionError::SourceUnavailable(stderr_tail(&output, 5)));
        }

        self.logs
            .info(id, format!("Repository cloned to {}", workdir.display()))
            .await;
        Ok(workdir)
    }

    async fn package(
        &self,
        id: DeploymentId,
        workdir: &Path,
        name: &str,
        port: u16,
    ) -> Result<String, ProvisionError> {
        let kind = detect_project_kind(workdir);
        self.logs
            .info(id, format!("Detected project type: {kind}"))
            .await;

        let dockerfile = workdir.join("Dockerfile");
        if !dockerfile.is_file() {
            let rendered = render_dockerfile(kind, port)
                .map_err(|e| ProvisionError::BuildFailed(format!("template error: {e}")))?;
            tokio::fs::write(&dockerfile, rendered)
                .await
                .map_err(|e| ProvisionError::BuildFailed(format!("cannot write Dockerfile: {e}")))?;
            self.logs.info(id, "Generated Dockerfile").await;
        }

        let tag = format!("{}:{id}", sanitize_image_name(name));
        self.logs.info(id, format!("Building image {tag}")).await;

        let mut build = tokio::process::Command::new("docker");
        build.args(["build", "-t", &tag, "."]).current_dir(workdir);
        let output = match tokio::time::timeout(self.build_timeout, build.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProvisionError::BuildFailed(format!(
                    "failed to run docker build: {e}"
                )));
            }
            Err(_) => {
                return Err(ProvisionError::BuildFailed(format!(
                    "build timed out after {}s",
                    self.build_timeout.as_secs()
                )));
            }
        };
        if !output.status.success() {
            return Err(ProvisionError::BuildFailed(stderr_tail(&output, 10)));
        }

        self.logs.info(id, format!("Image built: {tag}")).await;
        Ok(tag)
    }

    async fn run(
        &self,
        id: DeploymentId,
        image: &str,
        name: &str,
        port: u16,
        env: &HashMap<String, String>,
    ) -> Result<String, ProvisionError> {
        self.sweep_stale_instances(id, port).await;

        self.logs
            .info(id, format!("Starting container from image: {image}"))
            .await;

        let docker = get_docker();
        let container_name = format!("{}-{id}", sanitize_image_name(name));

        let container_port = format!("{port}/tcp");
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );
        let exposed_ports: Vec<String> = vec![container_port];

        let mut env_list: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env_list.push(format!("PORT={port}"));

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            env: Some(env_list),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options: CreateContainerOptions = CreateContainerOptionsBuilder::new()
            .name(&container_name)
            .build();

        let created = tokio::time::timeout(
            self.external_timeout,
            docker.create_container(Some(options), body),
        )
        .await
        .map_err(|_| ProvisionError::RunFailed("container create timed out".to_string()))?
        .map_err(|e| ProvisionError::RunFailed(e.to_string()))?;

        let start_options: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        let started = tokio::time::timeout(
            self.external_timeout,
            docker.start_container(&container_name, Some(start_options)),
        )
        .await
        .map_err(|_| ProvisionError::RunFailed("container start timed out".to_string()));
        match started {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Don't leave the created-but-never-started container
                // behind.
                let _ = self.destroy_instance(&created.id).await;
                return Err(ProvisionError::RunFailed(e.to_string()));
            }
            Err(e) => {
                let _ = self.destroy_instance(&created.id).await;
                return Err(e);
            }
        }

        self.logs
            .info(id, format!("Container started: {}", created.id))
            .await;
        Ok(created.id)
    }

    async fn stop_instance(&self, instance: &str) -> bool {
        let docker = get_docker();
        let options: StopContainerOptions = StopContainerOptionsBuilder::new().t(10).build();
        let stop = docker.stop_container(instance, Some(options));
        match tokio::time::timeout(self.external_timeout, stop).await {
            Ok(Ok(())) => true,
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => {
                log::warn!("Container {instance} not found, skipping stop");
                true
            }
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            })) => {
                log::info!("Container {instance} already stopped");
                true
            }
            Ok(Err(e)) => {
                log::warn!("Failed to stop container {instance}: {e}");
                false
            }
            Err(_) => {
                log::warn!("Stopping container {instance} timed out");
                false
            }
        }
    }

    async fn destroy_instance(&self, instance: &str) -> bool {
        let docker = get_docker();
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(true).build();
        let remove = docker.remove_container(instance, Some(options));
        match tokio::time::timeout(self.external_timeout, remove).await {
            Ok(Ok(())) => true,
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => {
                log::info!("Container {instance} not found, skipping removal");
                true
            }
            Ok(Err(e)) => {
                log::error!("Failed to remove container {instance}: {e}");
                false
            }
            Err(_) => {
                log::warn!("Removing container {instance} timed out");
                false
            }
        }
    }

    async fn destroy_image(&self, image: &str) -> bool {
        let docker = get_docker();
        let options: RemoveImageOptions = RemoveImageOptionsBuilder::new().force(true).build();
        let remove = docker.remove_image(image, Some(options), None);
        match tokio::time::timeout(self.external_timeout, remove).await {
            Ok(Ok(_)) => true,
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => {
                log::info!("Image {image} not found, skipping removal");
                true
            }
            Ok(Err(e)) => {
                log::error!("Failed to remove image {image}: {e}");
                false
            }
            Err(_) => {
                log::warn!("Removing image {image} timed out");
                false
            }
        }
    }

    async fn discard_source(&self, workdir: &Path) -> bool {
        match tokio::fs::remove_dir_all(workdir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                log::warn!("Failed to remove working tree {}: {e}", workdir.display());
                false
            }
        }
    }
}
