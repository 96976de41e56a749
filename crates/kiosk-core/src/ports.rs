//! Local port allocation.

use std::collections::BTreeSet;

/// Hands out unique local ports, scanning upward from a base port.
///
/// Not synchronized on its own: it lives inside the orchestrator's state
/// lock, so allocations and releases are serialized with every other
/// registry mutation.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    used: BTreeSet<u16>,
}

impl PortAllocator {
    /// Create an allocator with no ports in use.
    pub fn new(base: u16) -> Self {
        Self {
            base,
            used: BTreeSet::new(),
        }
    }

    /// Return the lowest free port at or above the base and mark it used.
    ///
    /// Returns `None` when every port up to `u16::MAX` is taken.
    pub fn allocate(&mut self) -> Option<u16> {
        let port = (self.base..=u16::MAX).find(|p| !self.used.contains(p))?;
        self.used.insert(port);
        Some(port)
    }

    /// Mark a port free again. Returns whether it was in use.
    pub fn release(&mut self, port: u16) -> bool {
        self.used.remove(&port)
    }

    /// Whether the port is currently handed out.
    pub fn is_used(&self, port: u16) -> bool {
        self.used.contains(&port)
    }

    /// Number of ports currently handed out.
    pub fn in_use(&self) -> usize {
        self.used.len()
    }
}
