//! Logical flows and the switch-level entries they are made of.
//!
//! A [`VTNFlow`] is one end-to-end path through the physical network. It is
//! realized by one [`FlowEntry`] per traversed switch, ordered from the switch
//! where packets enter the controlled network (the ingress entry, always at
//! index 0) to the egress switch. Flows are built once, stored in the flow
//! cache under their [`FlowGroupId`], and never mutated afterwards; a change in
//! any dependency removes the whole flow.

use std::{collections::BTreeSet, fmt};

use serde_derive::{Deserialize, Serialize};

use crate::common::{MacAddress, MacVlan, NodeId, PolicyId, SwitchPort, Vlan};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowGroupId {
    pub tenant: String,
    pub generation: u64,
}

impl fmt::Display for FlowGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.tenant, self.generation)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMatch {
    pub in_port: Option<u32>,
    pub vlan: Option<Vlan>,
    pub src_mac: Option<MacAddress>,
    pub dst_mac: Option<MacAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    Output(u32),
    SetVlan(Vlan),
    StripVlan,
    SetDlSrc(MacAddress),
    SetDlDst(MacAddress),
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    /// Cluster-unique name, used to correlate remote acknowledgements.
    pub name: String,
    pub node: NodeId,
    pub flow_match: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
}

impl FlowEntry {
    /// Ports this entry reads from or writes to.
    pub fn ports(&self) -> impl Iterator<Item = SwitchPort> + '_ {
        let node = self.node;
        self.flow_match
            .in_port
            .into_iter()
            .chain(self.actions.iter().filter_map(|action| match action {
                FlowAction::Output(port) => Some(*port),
                _ => None,
            }))
            .map(move |port| SwitchPort::new(node, port))
    }
}

/// Edge host of a logical flow: where the host attaches and what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L2Host {
    pub host: MacVlan,
    pub port: SwitchPort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDependency {
    /// Virtual nodes (bridges, interfaces, mappings) the route passes through.
    pub virtual_nodes: BTreeSet<String>,
    pub path_policy: PolicyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VTNFlow {
    pub group_id: FlowGroupId,
    entries: Vec<FlowEntry>,
    pub dependency: FlowDependency,
    pub ingress_host: Option<L2Host>,
    pub egress_host: Option<L2Host>,
}

impl VTNFlow {
    pub fn new(group_id: FlowGroupId) -> Self {
        Self {
            group_id,
            entries: Vec::new(),
            dependency: FlowDependency::default(),
            ingress_host: None,
            egress_host: None,
        }
    }

    /// Append an entry for the next switch on the path. The first entry added
    /// becomes the ingress entry.
    pub fn add_entry(
        &mut self,
        node: NodeId,
        flow_match: FlowMatch,
        actions: Vec<FlowAction>,
        priority: u16,
    ) -> &mut Self {
        let name = format!("{}-{}", self.group_id, self.entries.len());
        self.entries.push(FlowEntry {
            name,
            node,
            flow_match,
            actions,
            priority,
            idle_timeout: 0,
            hard_timeout: 0,
        });
        self
    }

    pub fn with_hosts(mut self, ingress: L2Host, egress: L2Host) -> Self {
        self.ingress_host = Some(ingress);
        self.egress_host = Some(egress);
        self
    }

    pub fn with_path_policy(mut self, policy: PolicyId) -> Self {
        self.dependency.path_policy = policy;
        self
    }

    pub fn depends_on(mut self, virtual_node: impl Into<String>) -> Self {
        self.dependency.virtual_nodes.insert(virtual_node.into());
        self
    }

    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }

    pub fn ingress(&self) -> Option<&FlowEntry> {
        self.entries.first()
    }

    /// Every entry except the ingress one.
    pub fn transit(&self) -> &[FlowEntry] {
        self.entries.get(1..).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn nodes(&self) -> BTreeSet<NodeId> {
        self.entries.iter().map(|entry| entry.node).collect()
    }

    pub fn edge_hosts(&self) -> impl Iterator<Item = &L2Host> {
        self.ingress_host.iter().chain(self.egress_host.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> VTNFlow {
        let mut flow = VTNFlow::new(FlowGroupId {
            tenant: "vtn1".to_string(),
            generation: 7,
        });
        flow.add_entry(
            NodeId(1),
            FlowMatch {
                in_port: Some(1),
                ..Default::default()
            },
            vec![FlowAction::Output(2)],
            10,
        )
        .add_entry(NodeId(2), FlowMatch::default(), vec![FlowAction::Output(5)], 10);
        flow
    }

    #[test]
    fn entry_names_follow_position() {
        let flow = flow();
        assert_eq!(flow.entries()[0].name, "vtn1-7-0");
        assert_eq!(flow.entries()[1].name, "vtn1-7-1");
        assert_eq!(flow.ingress().unwrap().node, NodeId(1));
        assert_eq!(flow.transit().len(), 1);
    }

    #[test]
    fn entry_ports() {
        let flow = flow();
        let ports: Vec<_> = flow.entries()[0].ports().collect();
        assert_eq!(
            ports,
            vec![SwitchPort::new(NodeId(1), 1), SwitchPort::new(NodeId(1), 2)]
        );
    }

    #[test]
    fn empty_flow_has_no_transit() {
        let flow = VTNFlow::new(FlowGroupId {
            tenant: "vtn1".to_string(),
            generation: 1,
        });
        assert!(flow.is_empty());
        assert!(flow.ingress().is_none());
        assert!(flow.transit().is_empty());
    }
}
