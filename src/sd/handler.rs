//! Per-connection session handler.
//!
//! Each accepted connection gets one [`ConnectedClient`]. It remembers which
//! session the connection holds (0 for none) and turns each request into one
//! response against the shared [`SessionTable`].

use super::codec::{Request, Response, SdServerCodec};
use super::table::SessionTable;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SESSION_ALREADY_OPEN: &str = "Session already open";
pub const NO_SESSION_OPEN: &str = "No session open";
pub const UNABLE_TO_RESUME: &str = "Unable to resume session";
pub const INVALID_COMMAND: &str = "Invalid command";

/// Sentinel for "no session held".
const NO_SESSION: u64 = 0;

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub response: Response,
    /// Close the connection after sending `response`.
    pub close: bool,
}

impl Reply {
    fn send(response: Response) -> Self {
        Self {
            response,
            close: false,
        }
    }

    fn send_and_close(response: Response) -> Self {
        Self {
            response,
            close: true,
        }
    }
}

/// State of one client connection.
pub struct ConnectedClient {
    table: Arc<SessionTable>,
    current_session_id: u64,
}

impl ConnectedClient {
    pub fn new(table: Arc<SessionTable>) -> Self {
        Self {
            table,
            current_session_id: NO_SESSION,
        }
    }

    /// Session held by this connection, if any.
    pub fn current_session(&self) -> Option<u64> {
        (self.current_session_id != NO_SESSION).then_some(self.current_session_id)
    }

    /// Apply one request.
    pub fn handle(&mut self, request: Request) -> Reply {
        match request {
            Request::Open => {
                if self.current_session().is_some() {
                    return Reply::send(Response::Error(SESSION_ALREADY_OPEN.to_string()));
                }
                let session_id = self.table.open_session();
                self.current_session_id = session_id;
                info!(session_id, "Session opened");
                Reply::send(Response::Accepted(session_id))
            }
            Request::Resume(session_id) => {
                if self.current_session().is_some() {
                    return Reply::send(Response::Error(SESSION_ALREADY_OPEN.to_string()));
                }
                if self.table.resume_session(session_id) {
                    self.current_session_id = session_id;
                    info!(session_id, "Session resumed");
                    Reply::send(Response::Accepted(session_id))
                } else {
                    debug!(session_id, "Resume refused");
                    Reply::send(Response::Rejected(UNABLE_TO_RESUME.to_string()))
                }
            }
            Request::Close(session_id) => match self.table.close_session(session_id) {
                Ok(()) => {
                    // Any connection may close a session; only the holder forgets it.
                    if self.current_session_id == session_id {
                        self.current_session_id = NO_SESSION;
                    }
                    info!(session_id, "Session closed");
                    Reply::send(Response::Closed(session_id))
                }
                Err(e) => Reply::send(Response::Error(e.to_string())),
            },
            Request::Get(name) => {
                let Some(session_id) = self.current_session() else {
                    return Reply::send(Response::Error(NO_SESSION_OPEN.to_string()));
                };
                match self.table.get_value(session_id, &name) {
                    Ok(content) => {
                        debug!(session_id, document = %name, bytes = content.len(), "Document read");
                        Reply::send(Response::Document { name, content })
                    }
                    Err(e) => Reply::send(Response::Error(e.to_string())),
                }
            }
            Request::Post { name, content } => {
                let Some(session_id) = self.current_session() else {
                    return Reply::send(Response::Error(NO_SESSION_OPEN.to_string()));
                };
                let bytes = content.len();
                match self.table.put_value(session_id, &name, content) {
                    Ok(()) => {
                        debug!(session_id, document = %name, bytes, "Document stored");
                        Reply::send(Response::Success)
                    }
                    Err(e) => Reply::send(Response::Error(e.to_string())),
                }
            }
            Request::Invalid(line) => {
                warn!(command = %line, "Invalid command");
                Reply::send_and_close(Response::Error(INVALID_COMMAND.to_string()))
            }
        }
    }

    /// Serve `stream` until the peer disconnects, a reply closes the
    /// connection, or `cancel` fires.
    pub async fn run<T>(mut self, stream: T, peer: SocketAddr, cancel: CancellationToken)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        debug!(peer = %peer, "Client connected");
        let mut framed = Framed::new(stream, SdServerCodec::new());

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = framed.next() => next,
            };

            let reply = match next {
                None => break,
                Some(Ok(request)) => self.handle(request),
                Some(Err(e)) if e.is_transport() => {
                    debug!(peer = %peer, error = %e, "Connection failed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(peer = %peer, error = %e, "Framing error");
                    Reply::send_and_close(Response::Error(INVALID_COMMAND.to_string()))
                }
            };

            if let Err(e) = framed.send(reply.response).await {
                debug!(peer = %peer, error = %e, "Failed to send response");
                break;
            }
            if reply.close {
                break;
            }
        }

        debug!(peer = %peer, session_id = self.current_session_id, "Client disconnected");
    }
}
