//! Environment-derived configuration.
//!
//! Everything operational comes from the environment (a `.env` file is
//! loaded at startup): the port range the allocator hands out from, the
//! base domain deployments are published under, the reverse-proxy
//! directories, the edge API credentials and the admin credential.

use std::path::PathBuf;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Credentials for the DNS/tunnel edge API. All three are required for
/// edge wiring; if any is missing the router runs proxy-only.
#[derive(Debug, Clone)]
pub struct EdgeApiConfig {
    pub api_token: String,
    pub zone_id: String,
    pub tunnel_id: String,
    pub api_base: String,
}

impl EdgeApiConfig {
    fn from_env() -> Option<Self> {
        let api_token = std::env::var("CLOUDFLARE_API_TOKEN").ok()?;
        let zone_id = std::env::var("CLOUDFLARE_ZONE_ID").ok()?;
        let tunnel_id = std::env::var("CLOUDFLARE_TUNNEL_ID").ok()?;
        Some(Self {
            api_token,
            zone_id,
            tunnel_id,
            api_base: env_or(
                "CLOUDFLARE_API_BASE",
                "https://api.cloudflare.com/client/v4",
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Inclusive bounds of the host-port range the allocator scans.
    pub min_port: u16,
    pub max_port: u16,

    /// Base domain subdomains are composed under.
    pub base_domain: String,

    /// Reverse-proxy configuration directories.
    pub proxy_available_dir: PathBuf,
    pub proxy_enabled_dir: PathBuf,

    pub edge: Option<EdgeApiConfig>,

    /// The single static admin credential.
    pub admin_username: String,
    pub admin_password: String,

    /// Origin the dashboard is served from, for CORS.
    pub dashboard_origin: String,

    /// Deadlines for external calls. Expiry counts as that step failing.
    pub clone_timeout: Duration,
    pub build_timeout: Duration,
    pub external_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let edge = EdgeApiConfig::from_env();
        if edge.is_none() {
            log::warn!(
                "Edge API credentials not fully configured, deployments will be proxy-only"
            );
        }
        Self {
            min_port: env_parse("MIN_PORT", 3000),
            max_port: env_parse("MAX_PORT", 8000),
            base_domain: env_or("BASE_DOMAIN", "yourdomain.com"),
            proxy_available_dir: env_or("NGINX_CONFIG_PATH", "/etc/nginx/sites-available").into(),
            proxy_enabled_dir: env_or("NGINX_ENABLED_PATH", "/etc/nginx/sites-enabled").into(),
            edge,
            admin_username: env_or("ADMIN_USERNAME", "admin"),
            admin_password: env_or("ADMIN_PASSWORD", "admin"),
            dashboard_origin: env_or("DASHBOARD_ORIGIN", "http://localhost:3000"),
            clone_timeout: Duration::from_secs(env_parse("CLONE_TIMEOUT_SECS", 300)),
            build_timeout: Duration::from_secs(env_parse("BUILD_TIMEOUT_SECS", 900)),
            external_timeout: Duration::from_secs(env_parse("EXTERNAL_TIMEOUT_SECS", 60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        assert_eq!(env_parse("SLIPWAY_TEST_UNSET_PORT", 3000u16), 3000);
        assert_eq!(env_or("SLIPWAY_TEST_UNSET_DOMAIN", "yourdomain.com"), "yourdomain.com");
    }

    #[test]
    fn garbage_values_fall_back() {
        unsafe { std::env::set_var("SLIPWAY_TEST_BAD_PORT", "not-a-number") };
        assert_eq!(env_parse("SLIPWAY_TEST_BAD_PORT", 8000u16), 8000);
        unsafe { std::env::remove_var("SLIPWAY_TEST_BAD_PORT") };
    }
}
