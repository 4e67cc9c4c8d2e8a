//! Reverse-proxy wiring.
//!
//! Writes one server block per deployment into the sites-available
//! directory, enables it with a symlink and reloads nginx. Removal
//! tolerates files that were never written so teardown can run against
//! a deployment that failed before wiring.

use std::path::PathBuf;
use std::time::Duration;

use minijinja::{Environment, context};

use crate::error::ProvisionError;
use crate::logs::LogSink;
use crate::model::DeploymentId;

const SERVER_BLOCK_TEMPLATE: &str = r#"server {
    listen 80;
    server_name {{ server_name }};

    location / {
        proxy_pass http://localhost:{{ port }};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
        proxy_read_timeout 86400;
        proxy_buffering off;
    }
}
"#;

pub fn render_server_block(server_name: &str, port: u16) -> Result<String, minijinja::Error> {
    let env = Environment::new();
    let template = env.template_from_str(SERVER_BLOCK_TEMPLATE)?;
    template.render(context! { server_name, port })
}

pub struct NginxProxy {
    available_dir: PathBuf,
    enabled_dir: PathBuf,
    base_domain: String,
    logs: LogSink,
    reload_timeout: Duration,
}

impl NginxProxy {
    pub fn new(
        available_dir: PathBuf,
        enabled_dir: PathBuf,
        base_domain: String,
        logs: LogSink,
        reload_timeout: Duration,
    ) -> Self {
        Self {
            available_dir,
            enabled_dir,
            base_domain,
            logs,
            reload_timeout,
        }
    }

    fn site_name(&self, subdomain: &str) -> String {
        format!("{subdomain}.{}", self.base_domain)
    }

    async fn write_site(&self, id: DeploymentId, subdomain: &str, port: u16) -> bool {
        let site = self.site_name(subdomain);
        self.logs
            .info(id, format!("Creating proxy config for {site}"))
            .await;
        let config = match render_server_block(&site, port) {
            Ok(config) => config,
            Err(e) => {
                self.logs
                    .error(id, format!("Failed to render proxy config: {e}"))
                    .await;
                return false;
            }
        };
        let path = self.available_dir.join(&site);
        if let Err(e) = tokio::fs::write(&path, config).await {
            self.logs
                .error(id, format!("Failed to write proxy config {}: {e}", path.display()))
                .await;
            return false;
        }
        true
    }

    async fn enable_site(&self, id: DeploymentId, subdomain: &str) -> bool {
        let site = self.site_name(subdomain);
        let available = self.available_dir.join(&site);
        let enabled = self.enabled_dir.join(&site);
        let _ = tokio::fs::remove_file(&enabled).await;
        match std::os::unix::fs::symlink(&available, &enabled) {
            Ok(()) => true,
            Err(e) => {
                self.logs
                    .error(id, format!("Failed to enable site {site}: {e}"))
                    .await;
                false
            }
        }
    }

    async fn reload(&self, id: DeploymentId) -> bool {
        self.logs.info(id, "Reloading proxy configuration").await;
        for (program, args) in [("nginx", vec!["-t"]), ("systemctl", vec!["reload", "nginx"])] {
            let mut command = tokio::process::Command::new(program);
            command.args(&args);
            let output = match tokio::time::timeout(self.reload_timeout, command.output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    self.logs
                        .error(id, format!("Failed to run {program}: {e}"))
                        .await;
                    return false;
                }
                Err(_) => {
                    self.logs
                        .error(id, format!("{program} timed out"))
                        .await;
                    return false;
                }
            };
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                self.logs
                    .error(id, format!("{program} failed: {}", stderr.trim()))
                    .await;
                return false;
            }
        }
        self.logs.info(id, "Proxy reloaded").await;
        true
    }

    /// Remove both the enabled symlink and the config file. Absent
    /// files are fine.
    async fn remove_site(&self, id: DeploymentId, subdomain: &str) -> bool {
        let site = self.site_name(subdomain);
        let mut ok = true;
        for path in [self.enabled_dir.join(&site), self.available_dir.join(&site)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.logs
                        .error(id, format!("Failed to remove {}: {e}", path.display()))
                        .await;
                    ok = false;
                }
            }
        }
        ok
    }

    /// Write, enable, reload. A failed reload rolls the config back out
    /// so nginx never keeps a half-wired site on disk.
    pub async fn wire(
        &self,
        id: DeploymentId,
        subdomain: &str,
        port: u16,
    ) -> Result<(), ProvisionError> {
        if !self.write_site(id, subdomain, port).await {
            return Err(ProvisionError::ProxyWireFailed(
                "could not write the site config".to_string(),
            ));
        }
        if !self.enable_site(id, subdomain).await {
            let _ = self.remove_site(id, subdomain).await;
            return Err(ProvisionError::ProxyWireFailed(
                "could not enable the site".to_string(),
            ));
        }
        if !self.reload(id).await {
            let _ = self.remove_site(id, subdomain).await;
            return Err(ProvisionError::ProxyWireFailed(
                "reload rejected the site".to_string(),
            ));
        }
        self.logs
            .info(id, format!("Proxy wired for {}", self.site_name(subdomain)))
            .await;
        Ok(())
    }

    /// Drop the site and reload. Safe when the site was never wired.
    pub async fn unwire(&self, id: DeploymentId, subdomain: &str) -> bool {
        let removed = self.remove_site(id, subdomain).await;
        let reloaded = self.reload(id).await;
        removed && reloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StateStore, tests::scratch_path};
    use std::sync::Arc;

    async fn proxy(tag: &str) -> (NginxProxy, PathBuf, PathBuf) {
        let base = std::env::temp_dir().join(format!("slipway-nginx-{tag}-{}", uuid::Uuid::new_v4()));
        let available = base.join("sites-available");
        let enabled = base.join("sites-enabled");
        std::fs::create_dir_all(&available).unwrap();
        std::fs::create_dir_all(&enabled).unwrap();
        let store = Arc::new(StateStore::open(scratch_path(tag)).await.unwrap());
        let proxy = NginxProxy::new(
            available.clone(),
            enabled.clone(),
            "example.dev".to_string(),
            LogSink::new(store),
            Duration::from_secs(5),
        );
        (proxy, available, enabled)
    }

    #[test]
    fn server_block_routes_the_subdomain_to_the_port() {
        let block = render_server_block("demo.example.dev", 3001).unwrap();
        assert!(block.contains("server_name demo.example.dev;"));
        assert!(block.contains("proxy_pass http://localhost:3001;"));
    }

    #[tokio::test]
    async fn write_and_enable_then_remove() {
        let (proxy, available, enabled) = proxy("cycle").await;
        let id = DeploymentId::new();
        assert!(proxy.write_site(id, "demo", 3005).await);
        assert!(proxy.enable_site(id, "demo").await);
        assert!(available.join("demo.example.dev").is_file());
        assert!(enabled.join("demo.example.dev").exists());
        assert!(proxy.remove_site(id, "demo").await);
        assert!(!available.join("demo.example.dev").exists());
        assert!(!enabled.join("demo.example.dev").exists());
    }

    #[tokio::test]
    async fn removing_a_site_that_never_existed_succeeds() {
        let (proxy, _, _) = proxy("absent").await;
        assert!(proxy.remove_site(DeploymentId::new(), "ghost").await);
    }
}
