//! Port leasing and resumable document sessions.
//!
//! This library provides two cooperating network services and their clients:
//!
//! - **PRS** (port reservation service, [`prs`]): a UDP service that leases
//!   TCP ports from a fixed range to named services. A lease lives as long
//!   as its holder keeps renewing it; an idle lease is reclaimed once the
//!   keep-alive window passes.
//!
//! - **SD** (session directory, [`sd`]): a TCP service that leases its own
//!   listening port from the PRS and stores named text documents in
//!   resumable sessions. Clients find it by looking its service name up.
//!
//! # Architecture
//!
//! - **Lease service**: one task owns the allocator and answers datagrams
//!   strictly in order. No locks.
//!
//! - **Session server**: one task per connection. Connections share a single
//!   [`sd::SessionTable`] behind one mutex, never held across an `.await`.
//!
//! - **Clients**: [`prs::PrsClient`] and [`sd::SdClient`] apply their own
//!   response timeout so a lost datagram or a stalled server cannot hang
//!   them.
//!
//! ## Lease protocol
//! - `REQUEST_PORT`: lease the lowest free port under a name
//! - `KEEP_ALIVE`: renew a held lease
//! - `CLOSE_PORT`: release a held lease
//! - `LOOKUP_PORT`: find the port leased under a name
//! - `STOP`: shut the service down
//!
//! ## Session protocol
//! - `open`, `resume <id>`, `close <id>`: session lifecycle
//! - `get <name>`, `post <name> <len> <content>`: documents in the held session

pub mod config;
pub mod error;
pub mod prs;
pub mod sd;
pub mod shutdown;

pub use config::{PrsConfig, SdClientConfig, SdServerConfig};
pub use error::{ConfigError, ProtocolError};
pub use prs::{LeaseService, PortLeaseAllocator, PrsClient, PrsClientError};
pub use sd::{SdClient, SdClientError, SdServer, SessionTable};
