//! Session server accept loop and its port lease lifecycle.

use super::handler::ConnectedClient;
use super::table::{SessionStats, SessionTable};
use crate::config::SdServerConfig;
use crate::prs::{spawn_keep_alive, PrsClient, PrsClientError};
use crate::shutdown::pause_unless_cancelled;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending connections the listener queues before refusing more.
const CLIENT_BACKLOG: u32 = 5;
/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF_MS: u64 = 100;

/// Error type for running a session server under a port lease.
#[derive(Debug, thiserror::Error)]
pub enum SdServerError {
    #[error("Port lease failed: {0}")]
    Lease(#[from] PrsClientError),
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// TCP front end of the session table.
pub struct SdServer {
    listener: TcpListener,
    table: Arc<SessionTable>,
}

impl SdServer {
    /// Listen on `addr` with a fresh session table.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(CLIENT_BACKLOG)?;
        Ok(Self::from_listener(listener, Arc::new(SessionTable::new())))
    }

    pub fn from_listener(listener: TcpListener, table: Arc<SessionTable>) -> Self {
        Self { listener, table }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires, then wait for every
    /// connection task to finish and return the final table statistics.
    pub async fn run(self, cancel: CancellationToken) -> SessionStats {
        info!(addr = ?self.listener.local_addr().ok(), "Session server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Session server shutting down");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let client = ConnectedClient::new(self.table.clone());
                        connections.spawn(client.run(stream, peer, cancel.child_token()));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        pause_unless_cancelled(Duration::from_millis(ACCEPT_ERROR_BACKOFF_MS), &cancel).await;
                    }
                },
            }
        }

        while connections.join_next().await.is_some() {}

        let stats = self.table.stats();
        info!(
            open_sessions = stats.open_sessions,
            issued_sessions = stats.issued_sessions,
            stored_documents = stats.stored_documents,
            "Session server stopped"
        );
        stats
    }
}

/// Lease a port from the PRS, serve sessions on it until `cancel` fires,
/// then give the port back.
pub async fn run_leased(
    config: &SdServerConfig,
    cancel: CancellationToken,
) -> Result<SessionStats, SdServerError> {
    let prs = Arc::new(
        PrsClient::connect(config.prs_addr, &config.service_name, config.response_timeout).await?,
    );
    let port = prs.request_port().await?;
    info!(port, service = %config.service_name, "Leased port");

    let addr = SocketAddr::new(config.bind_ip, port);
    let server = match SdServer::bind(addr) {
        Ok(server) => server,
        Err(source) => {
            release(&prs, port).await;
            return Err(SdServerError::Bind { addr, source });
        }
    };

    let keep_alive_cancel = cancel.child_token();
    let keep_alive = spawn_keep_alive(
        prs.clone(),
        port,
        config.keep_alive_interval,
        keep_alive_cancel.clone(),
    );

    let stats = server.run(cancel).await;

    keep_alive_cancel.cancel();
    if let Err(e) = keep_alive.await {
        error!(error = %e, "Keep-alive task panicked");
    }
    release(&prs, port).await;
    Ok(stats)
}

async fn release(prs: &PrsClient, port: u16) {
    match prs.close_port(port).await {
        Ok(()) => info!(port, "Released port"),
        Err(e) => warn!(port, error = %e, "Failed to release port"),
    }
}
