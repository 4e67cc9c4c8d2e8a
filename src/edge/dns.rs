//! DNS/tunnel edge wiring.
//!
//! Publishes a deployment's hostname as a proxied CNAME pointing at the
//! tunnel and removes the record (and any tunnel ingress rule for the
//! hostname) on teardown. Creating a record that already exists is
//! success, so re-running `wire` never duplicates it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::EdgeApiConfig;
use crate::error::ProvisionError;
use crate::logs::LogSink;
use crate::model::DeploymentId;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

/// Drop every ingress rule for `hostname`, keeping the rest (including
/// the catch-all) untouched.
fn filter_ingress(config: &Value, hostname: &str) -> Value {
    let ingress = config
        .get("ingress")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let kept: Vec<Value> = ingress
        .into_iter()
        .filter(|rule| rule.get("hostname").and_then(Value::as_str) != Some(hostname))
        .collect();
    Value::Array(kept)
}

pub struct EdgeDns {
    http: reqwest::Client,
    config: EdgeApiConfig,
    base_domain: String,
    logs: LogSink,
}

impl EdgeDns {
    pub fn new(
        config: EdgeApiConfig,
        base_domain: String,
        logs: LogSink,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build the edge HTTP client");
        Self {
            http,
            config,
            base_domain,
            logs,
        }
    }

    fn record_name(&self, subdomain: &str) -> String {
        format!("{subdomain}.{}", self.base_domain)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.config.api_token)
    }

    async fn list_records(&self, name: &str) -> Result<Vec<DnsRecord>, reqwest::Error> {
        let url = format!("{}/zones/{}/dns_records", self.config.api_base, self.config.zone_id);
        let envelope: Envelope<Vec<DnsRecord>> = self
            .auth(self.http.get(url).query(&[("name", name)]))
            .send()
            .await?
            .json()
            .await?;
        Ok(envelope.result.unwrap_or_default())
    }

    /// Create the proxied CNAME for `subdomain`. An existing record is
    /// treated as success.
    pub async fn create_record(
        &self,
        id: DeploymentId,
        subdomain: &str,
    ) -> Result<(), ProvisionError> {
        let name = self.record_name(subdomain);
        self.logs
            .info(id, format!("Creating DNS record for {name}"))
            .await;

        match self.list_records(&name).await {
            Ok(existing) if !existing.is_empty() => {
                self.logs
                    .info(id, format!("DNS record already exists for {name}"))
                    .await;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                self.logs
                    .error(id, format!("Failed to query DNS records: {e}"))
                    .await;
                return Err(ProvisionError::EdgeWireFailed(format!(
                    "record lookup failed: {e}"
                )));
            }
        }

        let url = format!("{}/zones/{}/dns_records", self.config.api_base, self.config.zone_id);
        let body = json!({
            "type": "CNAME",
            "name": subdomain,
            "content": format!("{}.cfargotunnel.com", self.config.tunnel_id),
            "ttl": 1,
            "proxied": true,
        });
        let response = self.auth(self.http.post(url).json(&body)).send().await;
        let created = match response {
            Ok(resp) => resp
                .json::<Envelope<Value>>()
                .await
                .map(|env| env.success)
                .unwrap_or(false),
            Err(e) => {
                self.logs
                    .error(id, format!("DNS record creation failed: {e}"))
                    .await;
                return Err(ProvisionError::EdgeWireFailed(format!(
                    "record creation failed: {e}"
                )));
            }
        };
        if created {
            self.logs
                .info(id, format!("DNS record created for {name}"))
                .await;
            Ok(())
        } else {
            self.logs
                .error(id, format!("Failed to create DNS record for {name}"))
                .await;
            Err(ProvisionError::EdgeWireFailed(
                "edge API rejected the record".to_string(),
            ))
        }
    }

    /// Delete every record for `subdomain`. Absent records are a no-op.
    pub async fn remove_records(&self, id: DeploymentId, subdomain: &str) -> bool {
        let name = self.record_name(subdomain);
        self.logs
            .info(id, format!("Removing DNS record for {name}"))
            .await;

        let records = match self.list_records(&name).await {
            Ok(records) => records,
            Err(e) => {
                self.logs
                    .error(id, format!("Failed to query DNS records: {e}"))
                    .await;
                return false;
            }
        };
        if records.is_empty() {
            self.logs
                .info(id, format!("No DNS record found for {name}"))
                .await;
            return true;
        }

        for record in records {
            let url = format!(
                "{}/zones/{}/dns_records/{}",
                self.config.api_base, self.config.zone_id, record.id
            );
            let deleted = match self.auth(self.http.delete(url)).send().await {
                Ok(resp) => resp
                    .json::<Envelope<Value>>()
                    .await
                    .map(|env| env.success)
                    .unwrap_or(false),
                Err(e) => {
                    self.logs
                        .error(id, format!("DNS record removal failed: {e}"))
                        .await;
                    return false;
                }
            };
            if !deleted {
                self.logs
                    .error(id, format!("Failed to delete DNS record for {name}"))
                    .await;
                return false;
            }
        }
        self.logs
            .info(id, format!("DNS record deleted for {name}"))
            .await;
        true
    }

    /// Remove any tunnel ingress rule for the hostname. A tunnel with
    /// no configuration is a no-op.
    pub async fn remove_tunnel_ingress(&self, id: DeploymentId, subdomain: &str) -> bool {
        let hostname = self.record_name(subdomain);
        self.logs
            .info(id, format!("Removing tunnel route for {hostname}"))
            .await;

        let url = format!(
            "{}/accounts/{}/cfd_tunnel/{}/configurations",
            self.config.api_base, self.config.zone_id, self.config.tunnel_id
        );
        let current = match self.auth(self.http.get(&url)).send().await {
            Ok(resp) => resp.json::<Envelope<Value>>().await.ok(),
            Err(e) => {
                self.logs
                    .error(id, format!("Failed to read tunnel configuration: {e}"))
                    .await;
                return false;
            }
        };
        let Some(config) = current.and_then(|env| env.result) else {
            self.logs.info(id, "No tunnel configuration found").await;
            return true;
        };
        let empty = json!({});
        let inner = config.get("config").unwrap_or(&empty);
        let updated = json!({ "config": { "ingress": filter_ingress(inner, &hostname) } });

        let result = match self.auth(self.http.put(&url).json(&updated)).send().await {
            Ok(resp) => resp
                .json::<Envelope<Value>>()
                .await
                .map(|env| env.success)
                .unwrap_or(false),
            Err(e) => {
                self.logs
                    .error(id, format!("Tunnel route removal failed: {e}"))
                    .await;
                return false;
            }
        };
        if result {
            self.logs
                .info(id, format!("Tunnel route removed for {hostname}"))
                .await;
        } else {
            self.logs
                .error(id, format!("Failed to remove tunnel route for {hostname}"))
                .await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_filter_drops_only_the_hostname() {
        let config = json!({
            "ingress": [
                { "hostname": "a.example.dev", "service": "http://localhost:3000" },
                { "hostname": "b.example.dev", "service": "http://localhost:3001" },
                { "service": "http_status:404" },
            ]
        });
        let kept = filter_ingress(&config, "a.example.dev");
        let kept = kept.as_array().unwrap();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0]["hostname"], "b.example.dev");
        assert!(kept[1].get("hostname").is_none());
    }

    #[test]
    fn ingress_filter_handles_missing_config() {
        let kept = filter_ingress(&json!({}), "a.example.dev");
        assert_eq!(kept, Value::Array(vec![]));
    }
}
