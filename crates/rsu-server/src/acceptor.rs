//! TCP accept loop. Binds the listen address and spawns one connection
//! engine per accepted socket.

use std::net::SocketAddr;
use std::sync::Arc;

use rsu_core::ProtocolSession;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::connection::{self, ConnectionHandle, ConnectionSink};
use crate::error::ServerError;
use crate::registry::ClientRegistry;

/// How long to pause after a transient accept error before retrying, to
/// avoid a hot loop when the OS is temporarily out of file descriptors.
const TRANSIENT_ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);

/// Bind `listen_addr` and run the accept loop until the listener itself
/// fails terminally (e.g. it was closed) or `shutdown_rx` is signaled, in
/// which case the listener is dropped and the loop exits cleanly with exit
/// code 0. Each accepted socket gets its own [`ProtocolSession`] and is
/// handed to [`connection::spawn`]. When
/// `max_connections` is set and the registry is already at capacity, newly
/// accepted sockets are closed immediately instead of being handed to the
/// connection engine.
///
/// # Errors
///
/// Returns `ServerError::Transport` if the initial bind fails.
pub async fn run(
    listen_addr: SocketAddr,
    heartbeat_interval: std::time::Duration,
    verify_bcc: bool,
    max_connections: Option<usize>,
    registry: Arc<ClientRegistry<ConnectionHandle>>,
    sink: Arc<dyn ConnectionSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "listening for RSU connections");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                tracing::info!("shutdown requested, closing listener");
                return Ok(());
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    if let Some(max) = max_connections {
                        if registry.snapshot().await.len() >= max {
                            tracing::warn!(remote = %peer_addr, max, "rejecting connection: at capacity");
                            drop(stream);
                            continue;
                        }
                    }

                    let session = Arc::new(ProtocolSession::new());
                    session.set_heartbeat_interval(heartbeat_interval.as_secs().max(1));

                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::debug!(%err, "failed to set TCP_NODELAY");
                    }

                    tracing::info!(remote = %peer_addr, "accepted connection");
                    connection::spawn(stream, peer_addr.ip(), session, sink.clone(), verify_bcc);
                }
                Err(err) if is_transient(&err) => {
                    tracing::warn!(%err, "transient accept error, retrying");
                    tokio::time::sleep(TRANSIENT_ACCEPT_BACKOFF).await;
                }
                Err(err) => {
                    tracing::error!(%err, "terminal accept error, stopping acceptor");
                    return Err(ServerError::Transport(err));
                }
            },
        }
    }
}

/// Distinguishes errors the accept loop should retry after (resource
/// exhaustion, a dropped half-open connection) from errors that mean the
/// listener itself is no longer usable.
fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reset_is_transient() {
        let err = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(is_transient(&err));
    }

    #[test]
    fn permission_denied_is_terminal() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(!is_transient(&err));
    }
}
