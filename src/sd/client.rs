//! Client side of the session protocol.

use super::codec::{Request, Response, SdClientCodec};
use crate::config::SdClientConfig;
use crate::error::ProtocolError;
use crate::prs::{PrsClient, PrsClientError};
use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// Error type for session client operations.
#[derive(Debug, thiserror::Error)]
pub enum SdClientError {
    #[error("Session server I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("No response from session server within {0:?}")]
    Timeout(Duration),
    #[error("Invalid session server response: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Session server closed the connection")]
    Disconnected,
    #[error("Failed to locate session server: {0}")]
    Lookup(#[from] PrsClientError),
    #[error("Session rejected: {0}")]
    Rejected(String),
    #[error("Session server error: {0}")]
    Server(String),
}

/// One connection to a session server.
///
/// A connection that times out or sees a malformed reply is unusable from
/// then on: a late reply could otherwise be read as the answer to the next
/// request.
pub struct SdClient {
    framed: Framed<TcpStream, SdClientCodec>,
    response_timeout: Duration,
    session_id: Option<u64>,
    broken: bool,
}

impl SdClient {
    pub async fn connect(addr: SocketAddr, response_timeout: Duration) -> Result<Self, SdClientError> {
        let stream = timeout(response_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SdClientError::Timeout(response_timeout))??;
        stream.set_nodelay(true)?;
        debug!(addr = %addr, "Connected to session server");
        Ok(Self {
            framed: Framed::new(stream, SdClientCodec::new()),
            response_timeout,
            session_id: None,
            broken: false,
        })
    }

    /// Look the server's port up with the PRS, then connect to it.
    pub async fn discover(config: &SdClientConfig) -> Result<Self, SdClientError> {
        let prs = PrsClient::connect(config.prs_addr, &config.service_name, config.response_timeout).await?;
        let port = prs.lookup_port().await?;
        info!(service = %config.service_name, port, "Found session server");
        Self::connect(SocketAddr::new(config.server_ip, port), config.response_timeout).await
    }

    /// Session this connection holds, as far as the client has been told.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    pub async fn open_session(&mut self) -> Result<u64, SdClientError> {
        match self.call(Request::Open).await? {
            Response::Accepted(id) => {
                self.session_id = Some(id);
                Ok(id)
            }
            other => self.unexpected(other),
        }
    }

    pub async fn resume_session(&mut self, session_id: u64) -> Result<u64, SdClientError> {
        match self.call(Request::Resume(session_id)).await? {
            Response::Accepted(id) => {
                self.session_id = Some(id);
                Ok(id)
            }
            other => self.unexpected(other),
        }
    }

    pub async fn close_session(&mut self, session_id: u64) -> Result<(), SdClientError> {
        match self.call(Request::Close(session_id)).await? {
            Response::Closed(id) => {
                if self.session_id == Some(id) {
                    self.session_id = None;
                }
                Ok(())
            }
            other => self.unexpected(other),
        }
    }

    pub async fn get_document(&mut self, name: &str) -> Result<String, SdClientError> {
        match self.call(Request::Get(name.to_string())).await? {
            Response::Document { name: returned, content } if returned == name => Ok(content),
            other => self.unexpected(other),
        }
    }

    pub async fn post_document(&mut self, name: &str, content: &str) -> Result<(), SdClientError> {
        let request = Request::Post {
            name: name.to_string(),
            content: content.to_string(),
        };
        match self.call(request).await? {
            Response::Success => Ok(()),
            other => self.unexpected(other),
        }
    }

    /// Close the connection. The held session stays open on the server and
    /// can be resumed later.
    pub async fn disconnect(mut self) {
        if let Err(e) = self.framed.close().await {
            debug!(error = %e, "Error while disconnecting");
        }
    }

    /// Send one request and wait for its response. `rejected` and `error`
    /// replies come back as errors.
    async fn call(&mut self, request: Request) -> Result<Response, SdClientError> {
        if self.broken {
            return Err(SdClientError::Disconnected);
        }
        let result = self.exchange(request).await;
        if matches!(
            result,
            Err(SdClientError::Timeout(_) | SdClientError::Protocol(_) | SdClientError::Io(_))
        ) {
            self.broken = true;
        }
        match result? {
            Response::Rejected(reason) => Err(SdClientError::Rejected(reason)),
            Response::Error(message) => Err(SdClientError::Server(message)),
            response => Ok(response),
        }
    }

    async fn exchange(&mut self, request: Request) -> Result<Response, SdClientError> {
        debug!(request = ?request, "Sending session request");
        self.framed.send(request).await?;
        let response = timeout(self.response_timeout, self.framed.next())
            .await
            .map_err(|_| SdClientError::Timeout(self.response_timeout))?
            .ok_or(SdClientError::Disconnected)??;
        Ok(response)
    }

    /// A reply that does not answer the request sent; the stream can no
    /// longer be trusted.
    fn unexpected<T>(&mut self, response: Response) -> Result<T, SdClientError> {
        self.broken = true;
        Err(ProtocolError::UnexpectedResponse(format!("{response:?}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sd::handler::{INVALID_COMMAND, NO_SESSION_OPEN, SESSION_ALREADY_OPEN};
    use crate::sd::server::SdServer;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn start_server() -> (SocketAddr, CancellationToken) {
        let server = SdServer::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).expect("bind");
        let addr = server.local_addr().expect("addr");
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (addr, cancel)
    }

    #[tokio::test]
    async fn test_server_errors_surface_as_errors() {
        let (addr, cancel) = start_server().await;
        let mut client = SdClient::connect(addr, Duration::from_secs(2)).await.expect("connect");

        match client.get_document("x").await {
            Err(SdClientError::Server(message)) => assert_eq!(message, NO_SESSION_OPEN),
            other => panic!("expected server error, got {other:?}"),
        }
        let id = client.open_session().await.expect("open");
        assert_eq!(client.session_id(), Some(id));
        match client.open_session().await {
            Err(SdClientError::Server(message)) => assert_eq!(message, SESSION_ALREADY_OPEN),
            other => panic!("expected server error, got {other:?}"),
        }
        assert!(matches!(
            client.get_document("missing").await,
            Err(SdClientError::Server(_))
        ));

        client.close_session(id).await.expect("close");
        assert_eq!(client.session_id(), None);
        client.disconnect().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_empty_and_multibyte_documents() {
        let (addr, cancel) = start_server().await;
        let mut client = SdClient::connect(addr, Duration::from_secs(2)).await.expect("connect");
        client.open_session().await.expect("open");

        client.post_document("empty", "").await.expect("post empty");
        assert_eq!(client.get_document("empty").await.expect("get"), "");

        let text = "naïve café\r\n\u{1F600}\n";
        client.post_document("utf8", text).await.expect("post utf8");
        assert_eq!(client.get_document("utf8").await.expect("get"), text);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_invalid_command_ends_connection() {
        let (addr, cancel) = start_server().await;
        let mut client = SdClient::connect(addr, Duration::from_secs(2)).await.expect("connect");
        match client.call(Request::Invalid("launch".to_string())).await {
            Err(SdClientError::Server(message)) => assert_eq!(message, INVALID_COMMAND),
            other => panic!("expected invalid command, got {other:?}"),
        }
        assert!(matches!(
            client.open_session().await,
            Err(SdClientError::Disconnected) | Err(SdClientError::Io(_)) | Err(SdClientError::Protocol(_))
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_timeout_when_server_is_silent() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let silent = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = stream.shutdown().await;
        });

        let mut client = SdClient::connect(addr, Duration::from_millis(100)).await.expect("connect");
        assert!(matches!(
            client.open_session().await,
            Err(SdClientError::Timeout(_))
        ));
        silent.abort();
    }

    #[tokio::test]
    async fn test_discover_without_registration_fails() {
        let prs = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
        let config = SdClientConfig {
            prs_addr: prs.local_addr().expect("addr"),
            response_timeout: Duration::from_millis(100),
            ..SdClientConfig::default()
        };
        assert!(matches!(
            SdClient::discover(&config).await,
            Err(SdClientError::Lookup(PrsClientError::Timeout(_)))
        ));
    }

    /// Accept one connection, read `expect` and answer it with `reply` after
    /// `delay`. Returns whatever the client sends afterwards.
    fn scripted_server(
        listener: TcpListener,
        expect: &'static [u8],
        reply: &'static [u8],
        delay: Duration,
    ) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut request = vec![0u8; expect.len()];
            stream.read_exact(&mut request).await.expect("request");
            assert_eq!(request, expect);
            tokio::time::sleep(delay).await;
            stream.write_all(reply).await.expect("reply");
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
            rest
        })
    }

    #[tokio::test]
    async fn test_late_reply_is_never_taken_for_the_next_answer() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = scripted_server(
            listener,
            b"get\na\n",
            b"success\na\n6\nSECRET",
            Duration::from_millis(300),
        );

        let mut client = SdClient::connect(addr, Duration::from_millis(100)).await.expect("connect");
        assert!(matches!(
            client.get_document("a").await,
            Err(SdClientError::Timeout(_))
        ));
        // Let the late reply land before asking for something else.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(matches!(
            client.get_document("b").await,
            Err(SdClientError::Disconnected)
        ));
        client.disconnect().await;

        let sent_after = server.await.expect("scripted server");
        assert!(sent_after.is_empty(), "request sent on a timed-out connection: {sent_after:?}");
    }

    #[tokio::test]
    async fn test_document_for_another_name_is_rejected() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = scripted_server(
            listener,
            b"get\nb\n",
            b"success\na\n6\nSECRET",
            Duration::ZERO,
        );

        let mut client = SdClient::connect(addr, Duration::from_secs(2)).await.expect("connect");
        assert!(matches!(
            client.get_document("b").await,
            Err(SdClientError::Protocol(ProtocolError::UnexpectedResponse(_)))
        ));
        assert!(matches!(
            client.open_session().await,
            Err(SdClientError::Disconnected)
        ));
        client.disconnect().await;
        assert!(server.await.expect("scripted server").is_empty());
    }
}
