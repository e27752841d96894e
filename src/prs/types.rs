//! Port lease slot and lease snapshot types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Holder of a leased port.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Holder {
    /// Service the port is leased to.
    service_name: String,
    /// Last reservation or keep-alive, used for expiry.
    last_renewed_at: Instant,
    /// Wall-clock time the lease was granted.
    reserved_at: DateTime<Utc>,
}

/// One slot of the leasable port range.
#[derive(Debug, Clone)]
pub struct PortLease {
    port: u16,
    holder: Option<Holder>,
}

impl PortLease {
    /// Create a free lease for `port`.
    pub fn new(port: u16) -> Self {
        Self { port, holder: None }
    }

    /// Port this slot leases.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether nobody holds the port.
    pub fn is_available(&self) -> bool {
        self.holder.is_none()
    }

    /// Owning service name, if held.
    pub fn service_name(&self) -> Option<&str> {
        self.holder.as_ref().map(|h| h.service_name.as_str())
    }

    /// Whether this lease is held by exactly `service_name`.
    pub fn is_held_by(&self, service_name: &str) -> bool {
        self.service_name() == Some(service_name)
    }

    /// A held lease whose last renewal is at least `timeout` before `now`.
    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        match &self.holder {
            Some(h) => now.saturating_duration_since(h.last_renewed_at) >= timeout,
            None => false,
        }
    }

    /// Hand the port to `service_name`, starting its keep-alive window at `now`.
    pub fn reserve(&mut self, service_name: &str, now: Instant) {
        self.holder = Some(Holder {
            service_name: service_name.to_string(),
            last_renewed_at: now,
            reserved_at: Utc::now(),
        });
    }

    /// Restart the keep-alive window at `now`.
    pub fn keep_alive(&mut self, now: Instant) {
        if let Some(h) = self.holder.as_mut() {
            h.last_renewed_at = now;
        }
    }

    /// Free the port.
    pub fn release(&mut self) {
        self.holder = None;
    }

    /// Snapshot of a held lease, `None` when free.
    pub fn info(&self, now: Instant) -> Option<LeaseInfo> {
        self.holder.as_ref().map(|h| LeaseInfo {
            port: self.port,
            service_name: h.service_name.clone(),
            reserved_at: h.reserved_at,
            idle_secs: now.saturating_duration_since(h.last_renewed_at).as_secs(),
        })
    }
}

/// Information about a held lease (serializable for reporting).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub port: u16,
    pub service_name: String,
    pub reserved_at: DateTime<Utc>,
    /// Seconds since the last reservation or keep-alive.
    pub idle_secs: u64,
}
