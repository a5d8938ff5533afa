//! RSU gateway daemon: TCP connection engine, client registry, acceptor,
//! and the operator control surface built on top of [`rsu_core`] and
//! [`rsu_proto`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod control_surface;
pub mod error;
pub mod registry;
pub mod sink;

pub use config::{Args, ServerConfig};
pub use connection::{ConnectionHandle, ConnectionSink, RegistrySink};
pub use control_surface::ControlSurface;
pub use error::ServerError;
pub use registry::ClientRegistry;
pub use sink::LoggingEventSink;

use std::sync::Arc;

use tokio::sync::watch;

/// Wire up and run the gateway daemon until the acceptor stops: either a
/// terminal bind/accept failure, or `shutdown_rx` being signaled, which
/// closes the listener and returns `Ok(())` (exit code 0 on normal
/// shutdown via signal).
///
/// # Errors
///
/// Propagates `ServerError::Transport` from a failed bind.
pub async fn run(config: ServerConfig, shutdown_rx: watch::Receiver<bool>) -> Result<(), ServerError> {
    let registry = Arc::new(ClientRegistry::<ConnectionHandle>::new());
    let event_sink: Arc<dyn rsu_core::EventSink> = Arc::new(LoggingEventSink);
    let connection_sink: Arc<dyn ConnectionSink> =
        Arc::new(RegistrySink::new(registry.clone(), event_sink));

    acceptor::run(
        config.listen_addr,
        config.heartbeat_interval,
        config.verify_bcc,
        config.max_connections,
        registry,
        connection_sink,
        shutdown_rx,
    )
    .await
}
