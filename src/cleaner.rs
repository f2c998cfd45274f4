//! Cleanup after a virtual mapping changed.
//!
//! A mapping change makes some hosts and flows stale. A [`MapCleaner`] carries
//! the keys a change touched, evicts the MAC table entries learned through
//! them and queues removal of the flows whose edge hosts match. MAC tables
//! and routes are advisory: an entry missed here causes a stale route until
//! the next topology event, so nothing is retried or rolled back.

use std::{collections::BTreeSet, fmt, sync::Arc};

use tracing::debug;

use crate::{
    common::{MacVlan, NodeVlan, PolicyId, PortVlan},
    flowdb::FlowRemover,
    manager::{RequestContext, VtnManager},
};

pub enum MapCleaner {
    /// VLAN mappings were removed.
    Vlan { unmapped: BTreeSet<NodeVlan> },
    /// Port mappings were removed.
    Port { unmapped: BTreeSet<PortVlan> },
    /// MAC mappings changed. A host claimed by another mapping in the
    /// meantime, as `reclaimed` tells, is left alone.
    Mac {
        mapped: BTreeSet<MacVlan>,
        unmapped: BTreeSet<MacVlan>,
        reclaimed: Arc<dyn Fn(&MacVlan) -> bool + Send + Sync>,
    },
    /// Path policies changed, flows they routed must be recomputed.
    Path { policies: BTreeSet<PolicyId> },
}

impl MapCleaner {
    /// Evict stale MAC entries of `tenant` and queue flow removals in
    /// `context`. Returns the number of MAC entries evicted.
    pub fn purge(&self, manager: &VtnManager, context: &mut RequestContext, tenant: &str) -> usize {
        let tables = manager.mac_tables();
        let evicted = match self {
            Self::Vlan { unmapped } => {
                let evicted = tables.flush(Some(tenant), |entry| {
                    unmapped
                        .iter()
                        .any(|key| key.contains(entry.port.node, entry.host.vlan))
                });
                for key in unmapped {
                    context.add_removal(FlowRemover::EdgeNodeVlan {
                        tenant: tenant.to_string(),
                        key: *key,
                    });
                }
                evicted.len()
            }
            Self::Port { unmapped } => {
                let evicted = tables.flush(Some(tenant), |entry| {
                    unmapped
                        .iter()
                        .any(|key| key.port == entry.port && key.vlan == entry.host.vlan)
                });
                for key in unmapped {
                    context.add_removal(FlowRemover::EdgePortVlan {
                        tenant: tenant.to_string(),
                        key: *key,
                    });
                }
                evicted.len()
            }
            Self::Mac {
                mapped,
                unmapped,
                reclaimed,
            } => {
                let stale: BTreeSet<_> = mapped
                    .union(unmapped)
                    .filter(|host| {
                        let keep = reclaimed(*host);
                        if keep {
                            debug!("{}: {}@{} reclaimed", tenant, host.mac, host.vlan);
                        }
                        !keep
                    })
                    .copied()
                    .collect();
                let evicted = tables.flush(Some(tenant), |entry| stale.contains(&entry.host));
                for host in stale {
                    context.add_removal(FlowRemover::EdgeHost {
                        tenant: tenant.to_string(),
                        host,
                    });
                }
                evicted.len()
            }
            Self::Path { policies } => {
                context.add_removal(FlowRemover::PathPolicy {
                    tenant: Some(tenant.to_string()),
                    policies: policies.clone(),
                });
                0
            }
        };
        debug!("{}: {} purged {} MAC entries", tenant, self, evicted);
        evicted
    }
}

impl fmt::Display for MapCleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vlan { unmapped } => write!(f, "vlan map cleaner ({} keys)", unmapped.len()),
            Self::Port { unmapped } => write!(f, "port map cleaner ({} keys)", unmapped.len()),
            Self::Mac {
                mapped, unmapped, ..
            } => write!(
                f,
                "mac map cleaner ({} mapped, {} unmapped)",
                mapped.len(),
                unmapped.len()
            ),
            Self::Path { policies } => write!(f, "path map cleaner {:?}", policies),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{
        common::{NodeId, SwitchPort},
        config::Config,
        flow::{FlowAction, FlowMatch, L2Host, VTNFlow},
        mac::BridgePath,
        simulated::Cluster,
        task::FlowModResult,
        tests::TRACING,
        wait::Interrupt,
    };

    fn port(node: u64, port: u32) -> SwitchPort {
        SwitchPort::new(NodeId(node), port)
    }

    fn learn(manager: &VtnManager, tenant: &str, mac: u64, vlan: u16, at: SwitchPort) {
        manager.learn(&BridgePath::new(tenant, "vbr1"), MacVlan::new(mac, vlan), at, None);
    }

    fn mac_count(manager: &VtnManager) -> usize {
        manager.mac_tables().lock().values().map(|table| table.len()).sum()
    }

    fn flow(manager: &VtnManager, tenant: &str, ingress: L2Host, egress: L2Host) -> VTNFlow {
        let mut flow = manager.new_flow(tenant).with_hosts(ingress, egress);
        flow.add_entry(
            ingress.port.node,
            FlowMatch {
                in_port: Some(ingress.port.port),
                vlan: Some(ingress.host.vlan),
                ..Default::default()
            },
            vec![FlowAction::Output(egress.port.port)],
            10,
        );
        flow
    }

    #[test]
    fn vlan_cleaner() {
        *TRACING;
        let cluster = Cluster::new("default", 1, Config::default());
        let manager = cluster.member(0).manager.clone();
        learn(&manager, "vtn1", 1, 10, port(1, 1));
        learn(&manager, "vtn1", 2, 10, port(2, 1));
        learn(&manager, "vtn1", 3, 20, port(1, 1));
        learn(&manager, "vtn2", 4, 10, port(1, 1));

        let cleaner = MapCleaner::Vlan {
            unmapped: [NodeVlan {
                node: Some(NodeId(1)),
                vlan: 10,
            }]
            .into_iter()
            .collect(),
        };
        let mut context = RequestContext::new();
        assert_eq!(manager.purge(&cleaner, &mut context, "vtn1"), 1);
        assert_eq!(mac_count(&manager), 3);
        assert_eq!(context.removals().len(), 1);
    }

    #[test]
    fn port_cleaner() {
        *TRACING;
        let cluster = Cluster::new("default", 1, Config::default());
        let manager = cluster.member(0).manager.clone();
        learn(&manager, "vtn1", 1, 0, port(1, 1));
        learn(&manager, "vtn1", 2, 0, port(1, 2));
        let cleaner = MapCleaner::Port {
            unmapped: [PortVlan {
                port: port(1, 2),
                vlan: 0,
            }]
            .into_iter()
            .collect(),
        };
        let mut context = RequestContext::new();
        assert_eq!(manager.purge(&cleaner, &mut context, "vtn1"), 1);
        assert!(manager
            .mac_tables()
            .lock()
            .values()
            .all(|table| table.get(&MacVlan::new(2, 0)).is_none()));
    }

    #[test]
    fn mac_cleaner_spares_reclaimed_hosts() {
        *TRACING;
        let cluster = Cluster::new("default", 1, Config::default());
        cluster.connect(NodeId(1), 0);
        let manager = cluster.member(0).manager.clone();
        for mac in 1..=3 {
            learn(&manager, "vtn1", mac, 0, port(1, mac as u32));
        }
        let hosts: Vec<_> = (1..=3)
            .map(|mac| L2Host {
                host: MacVlan::new(mac, 0),
                port: port(1, mac as u32),
            })
            .collect();
        let flows = [
            flow(&manager, "vtn1", hosts[0], hosts[2]),
            flow(&manager, "vtn1", hosts[1], hosts[2]),
        ];
        for flow in &flows {
            let future = manager.install_flow(flow.clone()).unwrap();
            assert_eq!(
                future.result(Some(Instant::now() + Duration::from_secs(5)), &Interrupt::default()),
                FlowModResult::Succeeded
            );
        }

        // host 2 moved under a port mapping
        let reclaimed = MacVlan::new(2, 0);
        let cleaner = MapCleaner::Mac {
            mapped: BTreeSet::new(),
            unmapped: [MacVlan::new(1, 0), MacVlan::new(2, 0)].into_iter().collect(),
            reclaimed: Arc::new(move |host: &MacVlan| *host == reclaimed),
        };
        let mut context = RequestContext::new();
        assert_eq!(manager.purge(&cleaner, &mut context, "vtn1"), 1);
        assert_eq!(mac_count(&manager), 2);

        let futures = manager.commit(context);
        assert_eq!(futures.len(), 1);
        assert_eq!(
            futures[0].result(Some(Instant::now() + Duration::from_secs(5)), &Interrupt::default()),
            FlowModResult::Succeeded
        );
        assert_eq!(manager.flow_db().len(), 1);
        assert!(manager.flow_db().get(&flows[1].group_id).is_some());
        assert_eq!(cluster.installed().len(), 1);
    }

    #[test]
    fn path_cleaner_queues_policy_removal() {
        *TRACING;
        let cluster = Cluster::new("default", 1, Config::default());
        let manager = cluster.member(0).manager.clone();
        let cleaner = MapCleaner::Path {
            policies: [1].into_iter().collect(),
        };
        let mut context = RequestContext::new();
        assert_eq!(manager.purge(&cleaner, &mut context, "vtn1"), 0);
        assert!(matches!(
            context.removals(),
            [FlowRemover::PathPolicy { tenant: Some(tenant), .. }] if tenant == "vtn1"
        ));
    }

    #[test]
    fn mode_change_purges_everything() {
        *TRACING;
        let cluster = Cluster::new("default", 1, Config::default());
        cluster.connect(NodeId(1), 0);
        let manager = cluster.member(0).manager.clone();
        learn(&manager, "vtn1", 1, 0, port(1, 1));
        let hosts = [
            L2Host {
                host: MacVlan::new(1, 0),
                port: port(1, 1),
            },
            L2Host {
                host: MacVlan::new(2, 0),
                port: port(1, 2),
            },
        ];
        let future = manager
            .install_flow(flow(&manager, "vtn2", hosts[0], hosts[1]))
            .unwrap();
        future.result(None, &Interrupt::default());

        let mut context = RequestContext::new();
        context.add_removal(FlowRemover::Tenant("vtn1".to_string()));
        context.set_mode_changed();
        let futures = manager.commit(context);
        assert_eq!(futures.len(), 1);
        assert_eq!(futures[0].result(None, &Interrupt::default()), FlowModResult::Succeeded);
        assert_eq!(mac_count(&manager), 0);
        assert!(manager.flow_db().is_empty());
        assert!(cluster.installed().is_empty());
    }
}
