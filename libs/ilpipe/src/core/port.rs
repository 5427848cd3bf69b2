// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Port descriptors and tunnel records.

use serde::{Deserialize, Serialize};

use super::component::{ComponentHandle, WeakComponentHandle};
use super::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDomain {
    Audio,
    Video,
    /// Clock and other control ports
    Other,
}

/// Which side of a tunnel allocates the buffers that cross it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BufferSupplier {
    #[default]
    Unspecified,
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDefinition {
    pub index: u32,
    pub direction: PortDirection,
    pub domain: PortDomain,
    pub enabled: bool,
    pub populated: bool,
}

/// Negotiation scratch passed between the two tunnel requests of
/// [`Core::setup_tunnel`](super::registry::Core::setup_tunnel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TunnelSetup {
    pub supplier: BufferSupplier,
}

/// One end of a tunnel as recorded on a port. The peer is held weakly so a
/// tunnel never keeps the other component alive.
#[derive(Clone)]
pub struct TunnelInfo {
    peer: WeakComponentHandle,
    pub peer_port: u32,
}

impl TunnelInfo {
    pub fn new(peer: &ComponentHandle, peer_port: u32) -> Self {
        Self {
            peer: peer.downgrade(),
            peer_port,
        }
    }

    pub fn peer(&self) -> Option<ComponentHandle> {
        self.peer.upgrade()
    }

    pub fn is_peer(&self, handle: &ComponentHandle) -> bool {
        self.peer.points_to(handle)
    }
}

impl std::fmt::Debug for TunnelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelInfo")
            .field("peer", &self.peer.upgrade().map(|p| p.name().to_string()))
            .field("peer_port", &self.peer_port)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Port {
    pub definition: PortDefinition,
    pub supplier: BufferSupplier,
    pub tunnel: Option<TunnelInfo>,
}

impl Port {
    /// A port that supplies its own buffers on the output side, which is what
    /// every component in this crate declares until negotiation says otherwise.
    pub fn new(index: u32, direction: PortDirection, domain: PortDomain) -> Self {
        Self {
            definition: PortDefinition {
                index,
                direction,
                domain,
                enabled: true,
                populated: false,
            },
            supplier: BufferSupplier::Output,
            tunnel: None,
        }
    }

    pub fn input(index: u32, domain: PortDomain) -> Self {
        Self::new(index, PortDirection::Input, domain)
    }

    pub fn output(index: u32, domain: PortDomain) -> Self {
        Self::new(index, PortDirection::Output, domain)
    }

    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }
}

/// Fixed set of ports created at construction.
#[derive(Debug, Clone)]
pub struct PortTable {
    ports: Vec<Port>,
}

impl PortTable {
    pub fn new(ports: Vec<Port>) -> Self {
        Self { ports }
    }

    pub fn get(&self, index: u32) -> Result<&Port> {
        self.ports
            .get(index as usize)
            .ok_or(PipelineError::BadPortIndex(index))
    }

    pub fn get_mut(&mut self, index: u32) -> Result<&mut Port> {
        self.ports
            .get_mut(index as usize)
            .ok_or(PipelineError::BadPortIndex(index))
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    pub fn clear_tunnels(&mut self) {
        for port in &mut self.ports {
            port.tunnel = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_defaults() {
        let port = Port::output(1, PortDomain::Video);
        assert_eq!(port.definition.direction, PortDirection::Output);
        assert_eq!(port.supplier, BufferSupplier::Output);
        assert!(port.definition.enabled);
        assert!(!port.is_tunneled());
    }

    #[test]
    fn test_port_table_bad_index() {
        let table = PortTable::new(vec![
            Port::output(0, PortDomain::Audio),
            Port::input(1, PortDomain::Other),
        ]);
        assert_eq!(table.len(), 2);
        assert!(table.get(1).is_ok());
        assert!(matches!(table.get(2), Err(PipelineError::BadPortIndex(2))));
    }
}
