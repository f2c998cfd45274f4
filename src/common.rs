use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_derive::{Deserialize, Serialize};
use tracing::error;

use crate::error::MalformedMessage;

/// Cluster member identifier, unique within one cluster.
pub type MemberId = u16;
pub type Vlan = u16;
/// Path policy identifier, 0 is the default policy.
pub type PolicyId = u32;

/// Datapath identifier of a physical switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OF-{:016x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SwitchPort {
    pub node: NodeId,
    pub port: u32,
}

impl SwitchPort {
    pub fn new(node: NodeId, port: u32) -> Self {
        Self { node, port }
    }
}

impl fmt::Display for SwitchPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub u64);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// Host key learned by a MAC table or claimed by a MAC mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacVlan {
    pub mac: MacAddress,
    pub vlan: Vlan,
}

impl MacVlan {
    pub fn new(mac: u64, vlan: Vlan) -> Self {
        Self {
            mac: MacAddress(mac),
            vlan,
        }
    }
}

/// VLAN mapping key. A `None` node maps the VLAN on every switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeVlan {
    pub node: Option<NodeId>,
    pub vlan: Vlan,
}

impl NodeVlan {
    pub fn contains(&self, node: NodeId, vlan: Vlan) -> bool {
        self.vlan == vlan && self.node.map(|n| n == node).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortVlan {
    pub port: SwitchPort,
    pub vlan: Vlan,
}

// providing deserialize to avoid accidentially using bincode::deserialize
// cluster peers may run a different build, never unwrap on their bytes
pub fn deserialize<M: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<M, MalformedMessage> {
    bincode::DefaultOptions::new()
        .allow_trailing_bytes()
        .deserialize(bytes)
        .map_err(|_| MalformedMessage)
}

pub fn serialize<M: Serialize>(message: &M) -> Vec<u8> {
    bincode::DefaultOptions::new()
        .serialize(message)
        .unwrap_or_else(|err| {
            // peers drop the empty payload as malformed
            error!("cannot encode message: {}", err);
            Vec::new()
        })
}
