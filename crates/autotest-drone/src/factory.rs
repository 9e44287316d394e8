//! Drone construction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info};

use crate::drone::Drone;
use crate::error::{DroneError, DroneResult};
use crate::transport::{LocalTransport, SshTransport};

/// Everything needed to reach one drone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroneSpec {
    pub hostname: String,
    /// ssh login; the current user when `None`.
    pub username: Option<String>,
    /// Autotest installation directory on the drone.
    pub installation_directory: PathBuf,
}

#[async_trait]
pub trait DroneFactory: Send + Sync {
    /// Build a drone handle, or fail with [`DroneError::Unreachable`].
    async fn create_drone(&self, spec: &DroneSpec) -> DroneResult<Drone>;
}

/// `localhost` runs in-process; anything else goes over ssh after a
/// reachability probe.
pub struct DefaultDroneFactory {
    max_transfer_processes: usize,
    connect_timeout: Duration,
}

impl DefaultDroneFactory {
    pub fn new(max_transfer_processes: usize) -> Self {
        Self {
            max_transfer_processes,
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl DroneFactory for DefaultDroneFactory {
    async fn create_drone(&self, spec: &DroneSpec) -> DroneResult<Drone> {
        if spec.hostname == "localhost" {
            let transport = LocalTransport::new(self.max_transfer_processes);
            return Ok(Drone::new("localhost", Arc::new(transport)));
        }

        let destination = match &spec.username {
            Some(user) => format!("{user}@{}", spec.hostname),
            None => spec.hostname.clone(),
        };
        let transport = SshTransport::new(destination, &spec.installation_directory)
            .with_max_transfer_processes(self.max_transfer_processes)
            .with_connect_timeout(self.connect_timeout);
        if !transport.is_up().await {
            error!(hostname = %spec.hostname, "drone is unreachable, kicking out");
            return Err(DroneError::Unreachable(spec.hostname.clone()));
        }

        info!(hostname = %spec.hostname, "drone reachable over ssh");
        Ok(Drone::new(spec.hostname.clone(), Arc::new(transport))
            .with_username(spec.username.clone()))
    }
}
