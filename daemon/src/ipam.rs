//! Virtual address pool

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AllocError {
    #[error("Network {0} has no assignable host addresses")]
    NoHosts(Ipv4Net),

    #[error("Address pool {0} exhausted")]
    Exhausted(Ipv4Net),
}

struct PoolState {
    /// Last address handed out by the counter
    last: u32,
    /// Retired addresses, reused most recent first
    recycled: Vec<u32>,
    /// Same members as `recycled`
    retired: HashSet<u32>,
}

/// Assigns host addresses of one IPv4 network.
///
/// Addresses run from network + 1 to broadcast - 1. Retired addresses are
/// handed out again before the counter advances.
pub struct AddressPool {
    network: Ipv4Net,
    first: u32,
    end: u32,
    state: Mutex<PoolState>,
}

impl AddressPool {
    pub fn new(network: Ipv4Net) -> Result<Self, AllocError> {
        let network = network.trunc();
        if network.prefix_len() >= 31 {
            return Err(AllocError::NoHosts(network));
        }

        let first = u32::from(network.network()) + 1;
        let end = u32::from(network.broadcast()) - 1;

        Ok(Self {
            network,
            first,
            end,
            state: Mutex::new(PoolState {
                last: first - 1,
                recycled: Vec::new(),
                retired: HashSet::new(),
            }),
        })
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Number of host addresses managed
    pub fn capacity(&self) -> usize {
        (self.end - self.first + 1) as usize
    }

    /// Number of addresses that can still be assigned
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        (self.end - state.last) as usize + state.recycled.len()
    }

    /// Take an unused address
    pub fn assign(&self) -> Result<Ipv4Addr, AllocError> {
        let mut state = self.state.lock();

        if let Some(value) = state.recycled.pop() {
            state.retired.remove(&value);
            trace!("Reassigned {}", Ipv4Addr::from(value));
            return Ok(Ipv4Addr::from(value));
        }

        if state.last >= self.end {
            return Err(AllocError::Exhausted(self.network));
        }
        state.last += 1;

        Ok(Ipv4Addr::from(state.last))
    }

    /// Return an address to the pool.
    ///
    /// Addresses outside the managed range, never assigned, or already
    /// retired are ignored.
    pub fn retire(&self, address: Ipv4Addr) {
        let value = u32::from(address);
        let mut state = self.state.lock();

        if value < self.first || value > state.last {
            warn!("Ignoring retire of unassigned address {}", address);
            return;
        }
        if !state.retired.insert(value) {
            warn!("Ignoring double retire of {}", address);
            return;
        }

        state.recycled.push(value);
        trace!("Retired {}", address);
    }
}
