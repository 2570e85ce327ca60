//! UDP port reservation
//!
//! Tests availability by actually binding, releases the OS binding right
//! away, and keeps a logical reservation so the same port is never handed
//! out twice concurrently. Reservations are owned by this allocator
//! instance and freed explicitly by the consumer.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::config::RtpConfig;
use crate::utils::net::bind_udp_socket;

/// Attempts before a reservation request gives up
const MAX_ATTEMPTS: usize = 10;

/// Process-wide UDP port bookkeeping for one bridge instance
pub struct PortAllocator {
    range_start: u16,
    range_end: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(config: &RtpConfig) -> Self {
        Self {
            range_start: config.port_range_start,
            range_end: config.port_range_end,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve one free UDP port
    ///
    /// Returns `None` when no port could be found within the attempt bound;
    /// the caller must abort whatever needed the port.
    pub fn reserve(&self) -> Option<u16> {
        for _ in 0..MAX_ATTEMPTS {
            let candidate = self.pick_candidate(0);
            if self.try_reserve(&[candidate]) {
                return Some(candidate);
            }
        }
        debug!("No free UDP port after {} attempts", MAX_ATTEMPTS);
        None
    }

    /// Reserve two consecutive UDP ports
    ///
    /// Required because the usual transport libraries assume RTCP lives at
    /// RTP+1. The returned pair is always `(port, port + 1)`.
    pub fn reserve_consecutive(&self) -> Option<(u16, u16)> {
        for _ in 0..MAX_ATTEMPTS {
            let candidate = self.pick_candidate(1);
            if self.try_reserve(&[candidate, candidate + 1]) {
                return Some((candidate, candidate + 1));
            }
        }
        debug!(
            "No consecutive UDP port pair after {} attempts",
            MAX_ATTEMPTS
        );
        None
    }

    /// Release a reservation
    pub fn free(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }

    /// Number of outstanding reservations
    pub fn reserved_count(&self) -> usize {
        self.in_use.lock().len()
    }

    fn pick_candidate(&self, headroom: u16) -> u16 {
        let end = self.range_end.saturating_sub(headroom).max(self.range_start);
        rand::thread_rng().gen_range(self.range_start..=end)
    }

    /// Atomically claim all ports, or none, after probing each one
    fn try_reserve(&self, ports: &[u16]) -> bool {
        let mut in_use = self.in_use.lock();
        if ports.iter().any(|p| in_use.contains(p)) {
            return false;
        }
        // Probe with a real bind; dropping the socket releases the OS
        // binding while the logical reservation stays
        for port in ports {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), *port);
            if bind_udp_socket(addr).is_err() {
                return false;
            }
        }
        for port in ports {
            in_use.insert(*port);
        }
        true
    }
}
