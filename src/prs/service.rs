//! Lease service loop.
//!
//! The loop owns the allocator outright and answers one datagram at a time,
//! so allocator state is never touched concurrently. A request that cannot
//! be decoded gets an `UNDEFINED_ERROR` reply; only `STOP` (after replying)
//! or cancellation ends the loop.

use super::allocator::{Allocation, LeaseOutcome, PortLeaseAllocator};
use super::message::{MessageType, PrsMessage, Status, MAX_DATAGRAM_SIZE};
use crate::shutdown::pause_unless_cancelled;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed receive before trying again.
const RECV_ERROR_BACKOFF_MS: u64 = 50;

/// Port reservation service bound to a UDP socket.
pub struct LeaseService {
    socket: UdpSocket,
    allocator: PortLeaseAllocator,
}

impl LeaseService {
    pub async fn bind(addr: SocketAddr, allocator: PortLeaseAllocator) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, allocator))
    }

    pub fn from_socket(socket: UdpSocket, allocator: PortLeaseAllocator) -> Self {
        Self { socket, allocator }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve requests until a `STOP` request arrives or `cancel` fires.
    ///
    /// Returns the allocator so callers can inspect the final lease table.
    pub async fn run(mut self, cancel: CancellationToken) -> PortLeaseAllocator {
        info!(
            addr = ?self.socket.local_addr().ok(),
            start_port = self.allocator.start_port(),
            end_port = self.allocator.end_port(),
            keep_alive_secs = self.allocator.keep_alive_timeout().as_secs(),
            "Lease service listening"
        );

        // One spare byte so an oversized datagram is detected instead of
        // silently truncated to a valid-looking message.
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];

        while !self.allocator.is_stopped() {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Lease service cancelled");
                    break;
                }
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "Failed to receive lease request");
                        pause_unless_cancelled(Duration::from_millis(RECV_ERROR_BACKOFF_MS), &cancel).await;
                        continue;
                    }
                },
            };

            let response = match PrsMessage::decode(&buf[..len]) {
                Ok(request) => {
                    debug!(
                        peer = %peer,
                        msg_type = %request.msg_type,
                        service = %request.service_name,
                        port = request.port,
                        "Received lease request"
                    );
                    handle_message(&mut self.allocator, &request)
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Undecodable lease request");
                    PrsMessage::undefined_error()
                }
            };

            if let Err(e) = self.socket.send_to(&response.encode(), peer).await {
                warn!(peer = %peer, error = %e, "Failed to send lease response");
            }
        }

        let leases = self.allocator.leases();
        info!(held = leases.len(), "Lease service stopped");
        for lease in &leases {
            debug!(
                port = lease.port,
                service = %lease.service_name,
                reserved_at = %lease.reserved_at,
                idle_secs = lease.idle_secs,
                "Lease outstanding at shutdown"
            );
        }
        self.allocator
    }
}

/// Apply one request to the allocator and build its response.
pub fn handle_message(allocator: &mut PortLeaseAllocator, msg: &PrsMessage) -> PrsMessage {
    let name = msg.service_name.as_str();
    match msg.msg_type {
        MessageType::RequestPort => {
            if name.is_empty() {
                warn!("Port requested without a service name");
                return PrsMessage::undefined_error();
            }
            match allocator.allocate(name) {
                Allocation::Granted(port) => {
                    info!(port, service = %name, "Lease granted");
                    PrsMessage::response(name, port, Status::Success)
                }
                Allocation::AllBusy => {
                    warn!(service = %name, "All ports busy");
                    PrsMessage::response(name, 0, Status::AllPortsBusy)
                }
            }
        }
        MessageType::KeepAlive => match allocator.renew(msg.port, name) {
            LeaseOutcome::Ok => {
                debug!(port = msg.port, service = %name, "Lease renewed");
                PrsMessage::response(name, msg.port, Status::Success)
            }
            LeaseOutcome::NotFound => {
                debug!(port = msg.port, service = %name, "Keep-alive for unknown lease");
                PrsMessage::response(name, msg.port, Status::ServiceNotFound)
            }
        },
        MessageType::ClosePort => match allocator.release(msg.port, name) {
            LeaseOutcome::Ok => {
                info!(port = msg.port, service = %name, "Lease released");
                PrsMessage::response(name, msg.port, Status::Success)
            }
            LeaseOutcome::NotFound => {
                debug!(port = msg.port, service = %name, "Close for unknown lease");
                PrsMessage::response(name, msg.port, Status::ServiceNotFound)
            }
        },
        MessageType::LookupPort => match allocator.lookup(name) {
            Some(port) => PrsMessage::response(name, port, Status::Success),
            None => PrsMessage::response(name, 0, Status::ServiceNotFound),
        },
        MessageType::Stop => {
            info!("Stop requested");
            allocator.request_stop();
            PrsMessage::response("", 0, Status::Success)
        }
        MessageType::Response => {
            warn!("Received a response message as a request");
            PrsMessage::undefined_error()
        }
    }
}
