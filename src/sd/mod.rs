//! Session directory (SD) service.
//!
//! Clients open a session, store and fetch named text documents in it, and
//! may drop the connection and resume the same session later by id. The
//! server finds its listening port by leasing one from the PRS under a
//! well-known service name; clients look that name up to connect.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   SD server process                      │
//! │                                                          │
//! │  run_leased ─▶ PrsClient::request_port                   │
//! │      │         spawn_keep_alive (every interval)         │
//! │      ▼                                                   │
//! │  SdServer::run (accept loop)                             │
//! │      ├─ conn 1 ─▶ ConnectedClient ─┐                     │
//! │      ├─ conn 2 ─▶ ConnectedClient ─┼─▶ Arc<SessionTable> │
//! │      └─ conn N ─▶ ConnectedClient ─┘    (one Mutex)      │
//! │                    Framed<TcpStream, SdServerCodec>      │
//! └──────────────────────────────────────────────────────────┘
//!        ▲
//!        │ open / resume / close / get / post
//! ┌──────────────┐
//! │   SdClient   │ ◀── PrsClient::lookup_port
//! └──────────────┘
//! ```

pub mod client;
pub mod codec;
pub mod handler;
pub mod server;
pub mod table;

pub use client::{SdClient, SdClientError};
pub use codec::{Request, Response, SdClientCodec, SdServerCodec};
pub use handler::{ConnectedClient, Reply};
pub use server::{run_leased, SdServer, SdServerError};
pub use table::{SessionError, SessionStats, SessionTable};
