// Port allocation for published container ports
// Hands out unique, currently-free host ports to every environment in the process

use crate::errors::{Result, TbError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpListener};

/// A port handed out by the allocator and who asked for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub holder: String,
}

/// Process-wide registry of allocated host ports
///
/// Construct one per process and share it (`Arc<PortAllocator>`) with every
/// orchestrator. Leases live as long as the allocator: a port is never
/// handed out twice by the same allocator.
#[derive(Debug, Default)]
pub struct PortAllocator {
    registry: Mutex<BTreeMap<u16, String>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free port in `[range_start, range_end]`
    pub fn allocate(&self, range_start: u16, range_end: u16) -> Result<u16> {
        self.allocate_for("anonymous", range_start, range_end)
            .map(|lease| lease.port)
    }

    /// Allocate a port on behalf of `holder`
    ///
    /// A candidate is eligible when it is not already leased and a bind on
    /// it succeeds. The scan and the insert run under one lock, so concurrent
    /// callers never receive the same port.
    pub fn allocate_for(&self, holder: &str, range_start: u16, range_end: u16) -> Result<PortLease> {
        let mut registry = self.registry.lock();

        for port in range_start..=range_end {
            if registry.contains_key(&port) {
                continue;
            }

            if !Self::is_bindable(port) {
                tracing::trace!(port, "port in use outside this process");
                continue;
            }

            registry.insert(port, holder.to_string());
            tracing::debug!(port, holder, "allocated port");
            return Ok(PortLease {
                port,
                holder: holder.to_string(),
            });
        }

        Err(TbError::ResourceExhausted {
            start: range_start,
            end: range_end,
        })
    }

    /// Bind and immediately release, proving nothing else holds the port
    fn is_bindable(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.registry.lock().contains_key(&port)
    }

    /// Ports held by `holder`, ascending
    pub fn get_ports(&self, holder: &str) -> Vec<u16> {
        self.registry
            .lock()
            .iter()
            .filter(|(_, h)| h.as_str() == holder)
            .map(|(port, _)| *port)
            .collect()
    }

    /// List all leases, ascending by port
    pub fn list_all(&self) -> Vec<PortLease> {
        self.registry
            .lock()
            .iter()
            .map(|(port, holder)| PortLease {
                port: *port,
                holder: holder.clone(),
            })
            .collect()
    }
}
