//! Interfaces of the collaborators the engine drives, and the messages
//! exchanged between cluster members.

use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    common::{MemberId, NodeId},
    flow::FlowEntry,
    task::FlowModResult,
};

/// Which controller owns the live connection to a switch right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    Local,
    NotLocal,
    Disconnected,
}

pub trait LocalityOracle: Send + Sync {
    fn locality(&self, node: NodeId) -> Locality;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("no response from switch")]
    Timeout,
    #[error("undefined switch status")]
    Undefined,
    #[error("switch rejected flow entry: {0}")]
    Rejected(String),
}

pub trait SwitchProgrammer: Send + Sync {
    fn install_flow_entry(&self, entry: &FlowEntry) -> Result<(), SwitchError>;
    fn uninstall_flow_entry(&self, entry: &FlowEntry) -> Result<(), SwitchError>;
}

/// Only consulted to choose a log level, never for control decisions.
pub trait Inventory: Send + Sync {
    fn exists(&self, node: NodeId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Every member except the sender.
    Broadcast,
    Member(MemberId),
}

/// Fire-and-forget delivery of encoded [`ClusterEvent`]s.
pub trait EventChannel: Send + Sync {
    fn local_member(&self) -> MemberId;
    fn remote_members(&self) -> usize;
    fn post(&self, destination: Destination, message: Vec<u8>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowModOperation {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// Ask every other member to program the entries it owns.
    FlowMod {
        request_id: u64,
        origin: MemberId,
        operation: FlowModOperation,
        entries: Vec<FlowEntry>,
    },
    /// Per-entry answer, sent back to the origin only.
    FlowModResult {
        request_id: u64,
        name: String,
        result: FlowModResult,
    },
}

#[derive(Clone)]
pub struct Collaborators {
    pub switch: Arc<dyn SwitchProgrammer>,
    pub locality: Arc<dyn LocalityOracle>,
    pub inventory: Arc<dyn Inventory>,
    pub channel: Arc<dyn EventChannel>,
}
