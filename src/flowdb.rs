//! The shared flow cache and the selectors that decide which flows a change
//! invalidates.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tracing::debug;

use crate::{
    cache::{MemoryCache, Step, TransactionalCache},
    common::{MacVlan, MemberId, NodeId, NodeVlan, PolicyId, PortVlan, SwitchPort},
    error::{Error, Result},
    flow::{FlowGroupId, VTNFlow},
};

pub type FlowCache = MemoryCache<FlowGroupId, VTNFlow>;

/// Selects the logical flows to remove.
#[derive(Clone)]
pub enum FlowRemover {
    All,
    Tenant(String),
    Group(FlowGroupId),
    /// Flows with an entry on the switch.
    Node(NodeId),
    /// Flows with an entry reading from or writing to the port.
    Port(SwitchPort),
    /// Flows whose ingress or egress host is `host`.
    EdgeHost { tenant: String, host: MacVlan },
    EdgeNodeVlan { tenant: String, key: NodeVlan },
    EdgePortVlan { tenant: String, key: PortVlan },
    /// Flows routed by one of the policies. No tenant means every tenant.
    PathPolicy {
        tenant: Option<String>,
        policies: BTreeSet<PolicyId>,
    },
    /// Flows passing through a virtual node.
    VirtualNode { tenant: String, name: String },
    Custom {
        description: String,
        matches: Arc<dyn Fn(&VTNFlow) -> bool + Send + Sync>,
    },
}

impl FlowRemover {
    pub fn matches(&self, flow: &VTNFlow) -> bool {
        let tenant_is = |tenant: &str| flow.group_id.tenant == tenant;
        match self {
            Self::All => true,
            Self::Tenant(tenant) => tenant_is(tenant),
            Self::Group(group_id) => flow.group_id == *group_id,
            Self::Node(node) => flow.entries().iter().any(|entry| entry.node == *node),
            Self::Port(port) => flow
                .entries()
                .iter()
                .any(|entry| entry.ports().any(|p| p == *port)),
            Self::EdgeHost { tenant, host } => {
                tenant_is(tenant) && flow.edge_hosts().any(|edge| edge.host == *host)
            }
            Self::EdgeNodeVlan { tenant, key } => {
                tenant_is(tenant)
                    && flow
                        .edge_hosts()
                        .any(|edge| key.contains(edge.port.node, edge.host.vlan))
            }
            Self::EdgePortVlan { tenant, key } => {
                tenant_is(tenant)
                    && flow
                        .edge_hosts()
                        .any(|edge| edge.port == key.port && edge.host.vlan == key.vlan)
            }
            Self::PathPolicy { tenant, policies } => {
                tenant.as_deref().map(tenant_is).unwrap_or(true)
                    && policies.contains(&flow.dependency.path_policy)
            }
            Self::VirtualNode { tenant, name } => {
                tenant_is(tenant) && flow.dependency.virtual_nodes.contains(name)
            }
            Self::Custom { matches, .. } => matches(flow),
        }
    }

    /// Whether the selection may span many flows, which changes the remote
    /// acknowledgement deadline.
    pub fn is_bulk(&self) -> bool {
        !matches!(self, Self::Group(_))
    }
}

impl fmt::Display for FlowRemover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all flows"),
            Self::Tenant(tenant) => write!(f, "tenant {}", tenant),
            Self::Group(group_id) => write!(f, "flow {}", group_id),
            Self::Node(node) => write!(f, "node {}", node),
            Self::Port(port) => write!(f, "port {}", port),
            Self::EdgeHost { tenant, host } => {
                write!(f, "{}: host {}@{}", tenant, host.mac, host.vlan)
            }
            Self::EdgeNodeVlan { tenant, key } => match key.node {
                Some(node) => write!(f, "{}: vlan {} on {}", tenant, key.vlan, node),
                None => write!(f, "{}: vlan {}", tenant, key.vlan),
            },
            Self::EdgePortVlan { tenant, key } => {
                write!(f, "{}: vlan {} on {}", tenant, key.vlan, key.port)
            }
            Self::PathPolicy { tenant, policies } => {
                write!(f, "{}: path policy {:?}", tenant.as_deref().unwrap_or("*"), policies)
            }
            Self::VirtualNode { tenant, name } => write!(f, "{}: {}", tenant, name),
            Self::Custom { description, .. } => write!(f, "{}", description),
        }
    }
}

impl fmt::Debug for FlowRemover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlowRemover({})", self)
    }
}

pub struct FlowDatabase {
    cache: TransactionalCache<FlowGroupId, VTNFlow>,
    generation: AtomicU64,
}

impl FlowDatabase {
    pub fn new(cache: TransactionalCache<FlowGroupId, VTNFlow>, member: MemberId) -> Self {
        Self {
            cache,
            // member id in the top bits keeps generations unique cluster-wide
            generation: AtomicU64::new((member as u64) << 48),
        }
    }

    pub fn next_group_id(&self, tenant: &str) -> FlowGroupId {
        FlowGroupId {
            tenant: tenant.to_string(),
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    pub fn cache(&self) -> &Arc<FlowCache> {
        self.cache.cache()
    }

    pub fn get(&self, group_id: &FlowGroupId) -> Option<VTNFlow> {
        self.cache().get(group_id)
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }

    /// Store a new flow. A flow with the same id must not exist.
    pub fn add(&self, flow: &VTNFlow) -> Result<()> {
        let exists = self.cache.execute(|tx| {
            if tx.get(&flow.group_id).is_some() {
                return Ok(Step::Abort(true));
            }
            tx.put(flow.group_id.clone(), flow.clone());
            Ok(Step::Commit(false))
        })?;
        if exists {
            return Err(Error::Fatal(format!("flow {} already exists", flow.group_id)));
        }
        Ok(())
    }

    pub fn remove(&self, group_id: &FlowGroupId) -> Result<Option<VTNFlow>> {
        self.cache.execute(|tx| match tx.remove(group_id) {
            Some(flow) => Ok(Step::Commit(Some(flow))),
            None => Ok(Step::Abort(None)),
        })
    }

    /// Remove every selected flow in one transaction and return them.
    pub fn remove_matching(&self, remover: &FlowRemover) -> Result<Vec<VTNFlow>> {
        let removed = self.cache.execute(|tx| {
            if let FlowRemover::Group(group_id) = remover {
                return Ok(match tx.remove(group_id) {
                    Some(flow) => Step::Commit(vec![flow]),
                    None => Step::Abort(Vec::new()),
                });
            }
            let removed: Vec<_> = tx
                .entries()
                .into_iter()
                .filter(|(_, flow)| remover.matches(flow))
                .map(|(_, flow)| flow)
                .collect();
            if removed.is_empty() {
                return Ok(Step::Abort(removed));
            }
            for flow in &removed {
                tx.remove(&flow.group_id);
            }
            Ok(Step::Commit(removed))
        })?;
        debug!("{}: {} flows removed from cache", remover, removed.len());
        Ok(removed)
    }

    /// Snapshot of the selected flows, outside any transaction.
    pub fn select(&self, remover: &FlowRemover) -> Vec<VTNFlow> {
        self.cache()
            .values()
            .into_iter()
            .filter(|flow| remover.matches(flow))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        common::Vlan,
        flow::{FlowAction, FlowMatch, L2Host},
    };

    fn database() -> FlowDatabase {
        FlowDatabase::new(
            TransactionalCache::new(Arc::default(), Duration::from_secs(1)),
            1,
        )
    }

    fn flow(db: &FlowDatabase, tenant: &str, nodes: &[u64], vlan: Vlan) -> VTNFlow {
        let mut flow = VTNFlow::new(db.next_group_id(tenant)).with_hosts(
            L2Host {
                host: MacVlan::new(0xa, vlan),
                port: SwitchPort::new(NodeId(nodes[0]), 1),
            },
            L2Host {
                host: MacVlan::new(0xb, vlan),
                port: SwitchPort::new(NodeId(*nodes.last().unwrap()), 2),
            },
        );
        for node in nodes {
            flow.add_entry(
                NodeId(*node),
                FlowMatch::default(),
                vec![FlowAction::Output(9)],
                10,
            );
        }
        flow
    }

    #[test]
    fn group_ids_carry_member() {
        let db = database();
        let id = db.next_group_id("vtn1");
        assert_eq!(id.generation, (1 << 48) + 1);
        assert_eq!(db.next_group_id("vtn1").generation, id.generation + 1);
    }

    #[test]
    fn add_twice_is_fatal() {
        let db = database();
        let flow = flow(&db, "vtn1", &[1, 2], 0);
        db.add(&flow).unwrap();
        assert!(matches!(db.add(&flow), Err(Error::Fatal(_))));
        assert_eq!(db.len(), 1);
        assert_eq!(db.remove(&flow.group_id).unwrap(), Some(flow.clone()));
        assert_eq!(db.remove(&flow.group_id).unwrap(), None);
    }

    #[test]
    fn remove_by_selector() {
        let db = database();
        let a = flow(&db, "vtn1", &[1, 2], 10);
        let b = flow(&db, "vtn1", &[2, 3], 20);
        let c = flow(&db, "vtn2", &[3, 4], 10);
        for f in [&a, &b, &c] {
            db.add(f).unwrap();
        }

        assert_eq!(db.select(&FlowRemover::Node(NodeId(2))).len(), 2);
        assert_eq!(
            db.select(&FlowRemover::Port(SwitchPort::new(NodeId(4), 9))),
            vec![c.clone()]
        );
        let removed = db
            .remove_matching(&FlowRemover::EdgeNodeVlan {
                tenant: "vtn1".to_string(),
                key: NodeVlan {
                    node: None,
                    vlan: 10,
                },
            })
            .unwrap();
        assert_eq!(removed, vec![a]);
        assert!(db
            .remove_matching(&FlowRemover::Tenant("vtn3".to_string()))
            .unwrap()
            .is_empty());
        assert_eq!(
            db.remove_matching(&FlowRemover::Tenant("vtn1".to_string()))
                .unwrap(),
            vec![b]
        );
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn path_policy_selector() {
        let db = database();
        let a = flow(&db, "vtn1", &[1], 0).with_path_policy(2);
        let b = flow(&db, "vtn2", &[1], 0).with_path_policy(3);
        let remover = FlowRemover::PathPolicy {
            tenant: None,
            policies: [2, 3].into_iter().collect(),
        };
        assert!(remover.matches(&a));
        assert!(remover.matches(&b));
        let remover = FlowRemover::PathPolicy {
            tenant: Some("vtn1".to_string()),
            policies: [3].into_iter().collect(),
        };
        assert!(!remover.matches(&a));
        assert!(!remover.matches(&b));
    }
}
