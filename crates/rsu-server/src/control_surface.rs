//! Operator control surface: the narrow façade external code uses to
//! inspect and command live connections. `connection.send_command`
//! and `session.set_heartbeat_interval` live directly on
//! [`ConnectionHandle`] and [`rsu_core::ProtocolSession`]; this module
//! only wraps registry lookup.

use std::net::IpAddr;
use std::sync::Arc;

use crate::connection::ConnectionHandle;
use crate::registry::ClientRegistry;

/// Read-only view over live connections, handed to whatever process
/// drives the daemon's operator interface.
#[derive(Clone)]
pub struct ControlSurface {
    registry: Arc<ClientRegistry<ConnectionHandle>>,
}

impl ControlSurface {
    /// Wrap a registry for external inspection.
    #[must_use]
    pub fn new(registry: Arc<ClientRegistry<ConnectionHandle>>) -> Self {
        Self { registry }
    }

    /// All currently connected devices.
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.registry.snapshot().await
    }

    /// The handle for a specific device, if connected.
    pub async fn get(&self, remote_ip: IpAddr) -> Option<ConnectionHandle> {
        self.registry.get(remote_ip).await
    }
}
