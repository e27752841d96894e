//! Client side of the lease protocol.

use super::message::{check_service_name, MessageType, PrsMessage, Status, MAX_DATAGRAM_SIZE};
use crate::error::ProtocolError;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for lease protocol client operations.
#[derive(Debug, thiserror::Error)]
pub enum PrsClientError {
    #[error("PRS I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("No response from PRS within {0:?}")]
    Timeout(Duration),
    #[error("Invalid PRS response: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("PRS replied {status} for service {service_name:?}")]
    Status {
        status: Status,
        service_name: String,
    },
}

/// Talks to a port reservation service on behalf of one named service.
pub struct PrsClient {
    socket: UdpSocket,
    service_name: String,
    response_timeout: Duration,
}

impl PrsClient {
    /// Bind an ephemeral local socket and associate it with the PRS at `server`.
    pub async fn connect(
        server: SocketAddr,
        service_name: &str,
        response_timeout: Duration,
    ) -> Result<Self, PrsClientError> {
        check_service_name(service_name)?;
        let local = match server {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(server).await?;
        Ok(Self {
            socket,
            service_name: service_name.to_string(),
            response_timeout,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Lease a port for this service.
    pub async fn request_port(&self) -> Result<u16, PrsClientError> {
        let response = self.call(MessageType::RequestPort, 0).await?;
        Ok(response.port)
    }

    /// Renew this service's lease on `port`.
    pub async fn keep_alive(&self, port: u16) -> Result<(), PrsClientError> {
        self.call(MessageType::KeepAlive, port).await.map(|_| ())
    }

    /// Give up this service's lease on `port`.
    pub async fn close_port(&self, port: u16) -> Result<(), PrsClientError> {
        self.call(MessageType::ClosePort, port).await.map(|_| ())
    }

    /// Find the port currently leased to this service.
    pub async fn lookup_port(&self) -> Result<u16, PrsClientError> {
        let response = self.call(MessageType::LookupPort, 0).await?;
        Ok(response.port)
    }

    /// Ask the PRS to shut down.
    pub async fn stop(&self) -> Result<(), PrsClientError> {
        let request = PrsMessage::request(MessageType::Stop, "", 0);
        let response = self.exchange(&request).await?;
        expect_success(response).map(|_| ())
    }

    async fn call(&self, msg_type: MessageType, port: u16) -> Result<PrsMessage, PrsClientError> {
        let request = PrsMessage::request(msg_type, &self.service_name, port);
        let response = self.exchange(&request).await?;
        expect_success(response)
    }

    /// Send one request datagram and wait for its reply.
    ///
    /// Replies that belong to another request, such as one that arrived
    /// after an earlier timeout, are dropped and waiting continues.
    pub async fn exchange(&self, request: &PrsMessage) -> Result<PrsMessage, PrsClientError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        self.discard_queued(&mut buf);

        debug!(
            msg_type = %request.msg_type,
            service = %request.service_name,
            port = request.port,
            "Sending lease request"
        );
        self.socket.send(&request.encode()).await?;

        timeout(self.response_timeout, self.recv_reply(request, &mut buf))
            .await
            .map_err(|_| PrsClientError::Timeout(self.response_timeout))?
    }

    async fn recv_reply(
        &self,
        request: &PrsMessage,
        buf: &mut [u8],
    ) -> Result<PrsMessage, PrsClientError> {
        loop {
            let len = self.socket.recv(buf).await?;
            let response = PrsMessage::decode(&buf[..len])?;
            if response.msg_type != MessageType::Response {
                return Err(ProtocolError::UnexpectedResponse(response.msg_type.to_string()).into());
            }
            if answers(request, &response) {
                return Ok(response);
            }
            debug!(
                service = %response.service_name,
                port = response.port,
                status = %response.status,
                "Discarding reply to another request"
            );
        }
    }

    /// Drop datagrams already queued on the socket before a new request.
    fn discard_queued(&self, buf: &mut [u8]) {
        while let Ok(len) = self.socket.try_recv(buf) {
            debug!(bytes = len, "Discarding late lease reply");
        }
    }
}

/// Whether `response` can be the reply to `request`.
///
/// An anonymous `UNDEFINED_ERROR` cannot be attributed and is taken as the
/// reply to whatever is outstanding.
fn answers(request: &PrsMessage, response: &PrsMessage) -> bool {
    if response.status == Status::UndefinedError && response.service_name.is_empty() {
        return true;
    }
    if response.service_name != request.service_name {
        return false;
    }
    match request.msg_type {
        MessageType::KeepAlive | MessageType::ClosePort => response.port == request.port,
        _ => true,
    }
}

fn expect_success(response: PrsMessage) -> Result<PrsMessage, PrsClientError> {
    match response.status {
        Status::Success => Ok(response),
        status => Err(PrsClientError::Status {
            status,
            service_name: response.service_name,
        }),
    }
}

/// Renew `port` every `interval` until `cancel` fires.
///
/// The task ends early if the PRS reports the lease as unknown, since the
/// port may already have been handed to another service.
pub fn spawn_keep_alive(
    client: Arc<PrsClient>,
    port: u16,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(port, service = %client.service_name(), interval_secs = interval.as_secs(), "Keeping lease alive");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match client.keep_alive(port).await {
                Ok(()) => debug!(port, "Lease renewed"),
                Err(PrsClientError::Status { status, .. }) => {
                    error!(port, status = %status, "Lease lost, no longer renewing");
                    break;
                }
                Err(e) => warn!(port, error = %e, "Keep-alive failed, will retry"),
            }
        }
    })
}
