//! Persisted record types.
//!
//! Three independent collections relate only through identifiers: a
//! deployment owns one port for its active lifetime and accumulates an
//! unbounded, insertion-ordered trail of build log entries. Deleting a
//! deployment never cascades into its logs.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque deployment identity. Parsed and formatted only at the HTTP
/// and storage boundaries; everywhere else it is passed as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(Uuid);

impl DeploymentId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DeploymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeploymentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle of a deployment. `Pending` is the only initial state;
/// `Running`, `Failed` and `Stopped` are terminal for the forward path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Building,
    Running,
    Failed,
    Stopped,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    /// Short name derived from the repository URL, used for image tags
    /// and container names.
    pub name: String,
    pub source_url: String,
    pub subdomain: String,
    pub port: u16,
    pub state: DeploymentState,
    /// Handle of the running container, set once `run` succeeded.
    pub container_id: Option<String>,
    /// Reference of the built image, set together with `container_id`.
    pub image_tag: Option<String>,
    pub env_vars: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(
        id: DeploymentId,
        name: String,
        source_url: String,
        subdomain: String,
        port: u16,
        env_vars: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            source_url,
            subdomain,
            port,
            state: DeploymentState::Pending,
            container_id: None,
            image_tag: None,
            env_vars,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One record per port number. Never destroyed, only toggled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub allocated: bool,
    pub owner: Option<DeploymentId>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Debug,
}

/// Append-only build/teardown log entry, keyed by deployment identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogEntry {
    pub id: Uuid,
    pub deployment_id: DeploymentId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl BuildLogEntry {
    pub fn new(deployment_id: DeploymentId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            deployment_id,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_id_round_trips_through_text() {
        let id = DeploymentId::new();
        let parsed: DeploymentId = id.to_string().parse().expect("Failed to parse id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn deployment_id_rejects_garbage() {
        assert!("not-an-id".parse::<DeploymentId>().is_err());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&DeploymentState::Building).unwrap();
        assert_eq!(json, "\"building\"");
        let back: DeploymentState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, DeploymentState::Failed);
    }

    #[test]
    fn terminal_states() {
        assert!(!DeploymentState::Pending.is_terminal());
        assert!(!DeploymentState::Building.is_terminal());
        assert!(DeploymentState::Running.is_terminal());
        assert!(DeploymentState::Failed.is_terminal());
        assert!(DeploymentState::Stopped.is_terminal());
    }
}
