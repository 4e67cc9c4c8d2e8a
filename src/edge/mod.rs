//! Public exposure of a running deployment.
//!
//! Wiring is two-phase: the reverse proxy is the prerequisite, the
//! DNS/tunnel record is attempted only once the proxy is in place and
//! its failure never unwinds the proxy rule — the service stays
//! reachable through the proxy directly.

use async_trait::async_trait;

use crate::model::DeploymentId;

pub mod dns;
pub mod proxy;

use dns::EdgeDns;
use proxy::NginxProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireResult {
    pub proxy_ok: bool,
    pub edge_ok: bool,
}

#[async_trait]
pub trait EdgeRouter: Send + Sync {
    /// Expose `subdomain` -> `port`. Wiring twice for the same
    /// subdomain is success, not duplication.
    async fn wire(&self, id: DeploymentId, subdomain: &str, port: u16) -> WireResult;

    /// Remove both the proxy rule and the edge record. Must be safe to
    /// call when neither exists.
    async fn unwire(&self, id: DeploymentId, subdomain: &str) -> bool;
}

pub struct NginxCloudflareRouter {
    proxy: NginxProxy,
    dns: Option<EdgeDns>,
}

impl NginxCloudflareRouter {
    pub fn new(proxy: NginxProxy, dns: Option<EdgeDns>) -> Self {
        Self { proxy, dns }
    }
}

#[async_trait]
impl EdgeRouter for NginxCloudflareRouter {
    async fn wire(&self, id: DeploymentId, subdomain: &str, port: u16) -> WireResult {
        if let Err(e) = self.proxy.wire(id, subdomain, port).await {
            log::debug!("{e}");
            return WireResult {
                proxy_ok: false,
                edge_ok: false,
            };
        }
        let edge_ok = match &self.dns {
            // The tunnel fronts the proxy, so wiring the edge is just
            // the DNS record; no per-deployment ingress rule is added.
            Some(dns) => match dns.create_record(id, subdomain).await {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("{e}");
                    false
                }
            },
            None => {
                log::info!("Edge API not configured, skipping DNS for {subdomain}");
                false
            }
        };
        WireResult {
            proxy_ok: true,
            edge_ok,
        }
    }

    async fn unwire(&self, id: DeploymentId, subdomain: &str) -> bool {
        let proxy_ok = self.proxy.unwire(id, subdomain).await;
        let dns_ok = match &self.dns {
            Some(dns) => {
                // Both attempted even if the first fails.
                let records = dns.remove_records(id, subdomain).await;
                let ingress = dns.remove_tunnel_ingress(id, subdomain).await;
                records && ingress
            }
            None => true,
        };
        proxy_ok && dns_ok
    }
}
