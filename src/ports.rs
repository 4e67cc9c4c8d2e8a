//! Exclusive port assignment.
//!
//! Hands out host ports from the configured `[min, max]` range, lowest
//! first. Exclusivity is delegated to the store, where claiming a port
//! is one atomic conditional update; this type never does a
//! read-then-write of its own.

use std::sync::Arc;

use crate::error::ProvisionError;
use crate::model::DeploymentId;
use crate::store::StateStore;

#[derive(Clone)]
pub struct PortAllocator {
    store: Arc<StateStore>,
    min_port: u16,
    max_port: u16,
}

impl PortAllocator {
    pub fn new(store: Arc<StateStore>, min_port: u16, max_port: u16) -> Self {
        Self {
            store,
            min_port,
            max_port,
        }
    }

    /// Claim the lowest free port for `owner`. Exhaustion is terminal
    /// for the current request; callers do not retry.
    pub async fn allocate(&self, owner: DeploymentId) -> Result<u16, ProvisionError> {
        match self
            .store
            .allocate_first_free(self.min_port, self.max_port, owner)
            .await?
        {
            Some(port) => {
                log::info!("Allocated port {port} to deployment {owner}");
                Ok(port)
            }
            None => {
                log::warn!(
                    "Port range {}-{} exhausted, rejecting deployment {owner}",
                    self.min_port,
                    self.max_port
                );
                Err(ProvisionError::NoPortsAvailable)
            }
        }
    }

    /// Free a port. Releasing a port that is already free succeeds as a
    /// no-op.
    pub async fn release(&self, port: u16) -> bool {
        match self.store.release_port(port).await {
            Ok(toggled) => {
                if toggled {
                    log::info!("Released port {port}");
                }
                true
            }
            Err(e) => {
                log::error!("Failed to persist release of port {port}: {e}");
                false
            }
        }
    }

    /// Advisory check only; never a substitute for `allocate`.
    pub async fn is_available(&self, port: u16) -> bool {
        self.store.port_available(port).await
    }
}
