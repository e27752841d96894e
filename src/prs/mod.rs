//! Port reservation service (PRS).
//!
//! Services lease a TCP port from a fixed range by name, keep the lease alive
//! while they run, and give it back when they stop. Clients find a service by
//! looking its name up.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                 PRS process                        │
//! │                                                    │
//! │  UDP datagram ──▶ LeaseService::run (one task)     │
//! │                   ├─ PrsMessage::decode            │
//! │                   ├─ handle_message                │
//! │                   │   └─ PortLeaseAllocator        │
//! │                   │       ├─ leases[start..=end]   │
//! │                   │       └─ lowest free hint      │
//! │                   └─ PrsMessage::encode ──▶ peer   │
//! └────────────────────────────────────────────────────┘
//!          ▲                               ▲
//!          │ REQUEST_PORT / KEEP_ALIVE     │ LOOKUP_PORT
//!   ┌──────────────┐                ┌──────────────┐
//!   │  SD server   │                │  SD client   │
//!   └──────────────┘                └──────────────┘
//! ```

pub mod allocator;
pub mod client;
pub mod message;
pub mod service;
mod types;

pub use allocator::{Allocation, LeaseOutcome, PortLeaseAllocator};
pub use client::{spawn_keep_alive, PrsClient, PrsClientError};
pub use message::{MessageType, PrsMessage, Status};
pub use service::LeaseService;
pub use types::{LeaseInfo, PortLease};
