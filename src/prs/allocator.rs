//! Port lease allocation over a fixed range.
//!
//! Expiry is detected lazily: every `allocate` and `lookup` first sweeps the
//! table and frees leases that have not been renewed within the keep-alive
//! window. There is no background timer, so the allocator is owned and mutated
//! by a single task and carries no lock.

use super::types::{LeaseInfo, PortLease};
use crate::error::ConfigError;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Granted(u16),
    AllBusy,
}

/// Result of a renew or release request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Ok,
    NotFound,
}

/// Allocates ports in `[start_port, end_port]` to named services.
pub struct PortLeaseAllocator {
    start_port: u16,
    end_port: u16,
    keep_alive_timeout: Duration,
    leases: Vec<PortLease>,
    /// Index of the lowest free lease, `leases.len()` when all are held.
    lowest_available: usize,
    stopped: bool,
}

impl PortLeaseAllocator {
    /// Create an allocator with every port in the inclusive range free.
    pub fn new(
        start_port: u16,
        end_port: u16,
        keep_alive_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if end_port < start_port {
            return Err(ConfigError::InvalidPortRange {
                start: start_port,
                end: end_port,
            });
        }
        let leases = (start_port..=end_port).map(PortLease::new).collect();
        Ok(Self {
            start_port,
            end_port,
            keep_alive_timeout,
            leases,
            lowest_available: 0,
            stopped: false,
        })
    }

    /// First port of the range.
    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    /// Last port of the range (inclusive).
    pub fn end_port(&self) -> u16 {
        self.end_port
    }

    /// Window a lease survives without renewal.
    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    /// Lease the lowest free port to `service_name`.
    pub fn allocate(&mut self, service_name: &str) -> Allocation {
        self.allocate_at(service_name, Instant::now())
    }

    /// [`allocate`](Self::allocate) with an explicit clock.
    pub fn allocate_at(&mut self, service_name: &str, now: Instant) -> Allocation {
        self.expire_at(now);

        let Some(lease) = self.leases.get_mut(self.lowest_available) else {
            return Allocation::AllBusy;
        };
        lease.reserve(service_name, now);
        let port = lease.port();

        self.lowest_available = self.next_available_from(self.lowest_available + 1);
        Allocation::Granted(port)
    }

    /// Refresh the keep-alive window of a lease held by `service_name`.
    pub fn renew(&mut self, port: u16, service_name: &str) -> LeaseOutcome {
        self.renew_at(port, service_name, Instant::now())
    }

    /// [`renew`](Self::renew) with an explicit clock.
    pub fn renew_at(&mut self, port: u16, service_name: &str, now: Instant) -> LeaseOutcome {
        match self.held_by_mut(port, service_name) {
            Some(lease) => {
                lease.keep_alive(now);
                LeaseOutcome::Ok
            }
            None => LeaseOutcome::NotFound,
        }
    }

    /// Free a lease held by `service_name`.
    pub fn release(&mut self, port: u16, service_name: &str) -> LeaseOutcome {
        let Some(lease) = self.held_by_mut(port, service_name) else {
            return LeaseOutcome::NotFound;
        };
        lease.release();

        let index = self.index_of(port);
        if index < self.lowest_available {
            self.lowest_available = index;
        }
        LeaseOutcome::Ok
    }

    /// Find the lowest port leased to `service_name`.
    pub fn lookup(&mut self, service_name: &str) -> Option<u16> {
        self.lookup_at(service_name, Instant::now())
    }

    /// [`lookup`](Self::lookup) with an explicit clock.
    pub fn lookup_at(&mut self, service_name: &str, now: Instant) -> Option<u16> {
        self.expire_at(now);
        self.leases
            .iter()
            .find(|l| l.is_held_by(service_name))
            .map(PortLease::port)
    }

    /// Free every lease whose keep-alive window has elapsed.
    ///
    /// Returns the number of leases reclaimed.
    pub fn expire_at(&mut self, now: Instant) -> usize {
        let timeout = self.keep_alive_timeout;
        let mut reclaimed = 0;
        for (index, lease) in self.leases.iter_mut().enumerate() {
            if lease.is_expired(timeout, now) {
                debug!(
                    port = lease.port(),
                    service = lease.service_name().unwrap_or_default(),
                    "Lease expired"
                );
                lease.release();
                reclaimed += 1;
                if index < self.lowest_available {
                    self.lowest_available = index;
                }
            }
        }
        reclaimed
    }

    /// Ask the owning service loop to stop after the current request.
    pub fn request_stop(&mut self) {
        self.stopped = true;
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Number of ports in the range.
    pub fn capacity(&self) -> usize {
        self.leases.len()
    }

    /// Number of free ports.
    pub fn available_count(&self) -> usize {
        self.leases.iter().filter(|l| l.is_available()).count()
    }

    /// Number of leased ports.
    pub fn held_count(&self) -> usize {
        self.capacity() - self.available_count()
    }

    /// Snapshot of all held leases in port order.
    pub fn leases(&self) -> Vec<LeaseInfo> {
        let now = Instant::now();
        self.leases.iter().filter_map(|l| l.info(now)).collect()
    }

    fn index_of(&self, port: u16) -> usize {
        usize::from(port - self.start_port)
    }

    fn held_by_mut(&mut self, port: u16, service_name: &str) -> Option<&mut PortLease> {
        if port < self.start_port || port > self.end_port {
            return None;
        }
        let index = self.index_of(port);
        self.leases
            .get_mut(index)
            .filter(|l| l.is_held_by(service_name))
    }

    fn next_available_from(&self, start: usize) -> usize {
        (start..self.leases.len())
            .find(|&i| self.leases[i].is_available())
            .unwrap_or(self.leases.len())
    }
}
