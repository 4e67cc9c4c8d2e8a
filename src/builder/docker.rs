//! Shared Docker client.
//!
//! Lazily connects on first use with the default connection method
//! (Unix socket on Linux/macOS, named pipe on Windows).

use bollard::Docker;
use std::sync::OnceLock;

static DOCKER_CLIENT: OnceLock<Docker> = OnceLock::new();

pub fn get_docker() -> &'static Docker {
    DOCKER_CLIENT.get_or_init(|| {
        Docker::connect_with_local_defaults().expect("Failed to connect to Docker daemon")
    })
}
