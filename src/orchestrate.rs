//! Add and remove orchestrators for logical flows.
//!
//! Both split the entries of a flow by the locality of their switch: entries
//! on switches this member owns become [`FlowModTask`](crate::task::FlowModTask)s
//! on the worker pool, the rest travel in one batch to the other members and
//! are tracked by a [`RemoteFlowRequest`].
//!
//! Adding installs every transit entry first and the ingress entry last, so
//! no packet enters a path that is not complete yet. Any failure rolls the
//! flow back: local entries are uninstalled, a compensating remove is sent to
//! the other members, and the flow record leaves the cache.
//!
//! Removing drops the record first, then uninstalls ingress entries under a
//! fraction of the deadline and everything else under the full one. Removal
//! failures are logged and never compensated.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    cluster::{FlowModOperation, Locality, LocalityOracle},
    common::NodeId,
    config::Config,
    error::{Error, Result},
    flow::{FlowEntry, VTNFlow},
    flowdb::FlowRemover,
    manager::VtnManager,
    remote::RemoteFlowRequest,
    task::{FlowModFuture, FlowModJob, FlowModResult},
    wait::Interrupt,
};

#[derive(Debug, Default)]
pub(crate) struct Partition {
    pub local: Vec<FlowEntry>,
    pub remote: Vec<FlowEntry>,
    pub disconnected: Vec<NodeId>,
}

pub(crate) fn partition<'a>(
    locality: &dyn LocalityOracle,
    entries: impl IntoIterator<Item = &'a FlowEntry>,
) -> Partition {
    let mut partition = Partition::default();
    for entry in entries {
        match locality.locality(entry.node) {
            Locality::Local => partition.local.push(entry.clone()),
            Locality::NotLocal => partition.remote.push(entry.clone()),
            Locality::Disconnected => partition.disconnected.push(entry.node),
        }
    }
    partition
}

/// Reject a flow that cannot be installed from this member, before anything
/// is stored or sent.
pub(crate) fn validate(flow: &VTNFlow, locality: &dyn LocalityOracle) -> Result<()> {
    let ingress = flow
        .ingress()
        .ok_or_else(|| Error::Fatal(format!("flow {} has no entries", flow.group_id)))?;
    if locality.locality(ingress.node) != Locality::Local {
        return Err(Error::Fatal(format!(
            "flow {}: ingress switch {} is not local",
            flow.group_id, ingress.node
        )));
    }
    let Partition { disconnected, .. } = partition(locality, flow.transit());
    if let Some(node) = disconnected.first() {
        return Err(Error::Fatal(format!(
            "flow {}: switch {} is disconnected",
            flow.group_id, node
        )));
    }
    Ok(())
}

/// What an add has sent to the network so far.
#[derive(Default)]
struct Dispatched {
    local: Vec<(FlowEntry, Arc<FlowModFuture>)>,
    remote: Option<(Arc<RemoteFlowRequest>, Vec<FlowEntry>)>,
}

pub struct FlowAddTask {
    manager: Arc<VtnManager>,
    flow: VTNFlow,
    requests: Vec<u64>,
}

impl FlowAddTask {
    pub fn new(manager: Arc<VtnManager>, flow: VTNFlow) -> Self {
        Self {
            manager,
            flow,
            requests: Vec::new(),
        }
    }

    fn remote(
        &mut self,
        operation: FlowModOperation,
        entries: Vec<FlowEntry>,
    ) -> Arc<RemoteFlowRequest> {
        let request = self.manager.dispatch_remote(operation, entries);
        self.requests.push(request.request_id());
        request
    }

    fn install(&mut self, dispatched: &mut Dispatched, interrupt: &Interrupt) -> FlowModResult {
        let manager = self.manager.clone();
        let config = manager.config();
        if let Err(err) = validate(&self.flow, manager.collaborators().locality.as_ref()) {
            error!("{}", err);
            return FlowModResult::Failed;
        }
        let Partition { local, remote, .. } =
            partition(manager.collaborators().locality.as_ref(), self.flow.transit());

        for entry in local {
            let future = manager.dispatch_local(FlowModOperation::Add, entry.clone());
            dispatched.local.push((entry, future));
        }
        if !remote.is_empty() {
            let request = self.remote(FlowModOperation::Add, remote.clone());
            dispatched.remote = Some((request, remote));
        }

        let deadline = Instant::now() + config.flow_mod_timeout();
        for (entry, future) in &dispatched.local {
            let result = future.result(Some(deadline), interrupt);
            if !result.is_success() {
                debug!("{}: {} {:?}", self.describe(), entry.name, result);
                return result;
            }
        }
        if let Some((request, _)) = &dispatched.remote {
            let deadline = Instant::now() + config.remote_flow_mod_timeout();
            if !request.get_result_abs(deadline, false, interrupt) {
                return request.outcome().unwrap_or(FlowModResult::Failed);
            }
        }

        // the rest of the path is in place
        let ingress = match self.flow.ingress() {
            Some(ingress) => ingress.clone(),
            None => return FlowModResult::Failed,
        };
        let future = manager.dispatch_local(FlowModOperation::Add, ingress.clone());
        dispatched.local.push((ingress, future.clone()));
        future.result(Some(Instant::now() + config.flow_mod_timeout()), interrupt)
    }

    fn rollback(&mut self, dispatched: Dispatched) {
        warn!("{}: roll back", self.describe());
        let manager = self.manager.clone();
        let config = manager.config();
        // rollback runs to completion even when the task was interrupted
        let patience = Interrupt::default();

        let request = dispatched.remote.map(|(request, entries)| {
            // remote owners may still be installing
            let deadline = Instant::now() + config.remote_flow_mod_timeout();
            if !request.wait_pending(deadline, &patience) {
                warn!("{}: remote install still pending", self.describe());
            }
            self.remote(FlowModOperation::Remove, entries)
        });

        let deadline = Instant::now() + config.flow_mod_timeout();
        for (entry, future) in dispatched.local {
            // an install still in flight must not overtake its uninstall
            future.result(Some(deadline), &patience);
            let name = entry.name.clone();
            // on this thread, the pool may already refuse work
            let result = manager
                .entry_task(FlowModOperation::Remove, entry)
                .run(&patience);
            if !result.is_success() {
                warn!("{}: uninstall {}: {:?}", self.describe(), name, result);
            }
        }
        if let Some(request) = request {
            let deadline = Instant::now() + config.remote_flow_mod_timeout();
            if !request.get_result_abs(deadline, true, &patience) {
                warn!("{}: remote uninstall incomplete", self.describe());
            }
        }
        self.forget();
    }

    fn forget(&self) {
        match self.manager.flow_db().remove(&self.flow.group_id) {
            Ok(Some(_)) => debug!("{}: record removed", self.describe()),
            Ok(None) => debug!("{}: record already gone", self.describe()),
            Err(err) => error!("{}: cannot remove record: {}", self.describe(), err),
        }
    }
}

impl FlowModJob for FlowAddTask {
    fn describe(&self) -> String {
        format!("add flow {}", self.flow.group_id)
    }

    fn execute(&mut self, interrupt: &Interrupt) -> FlowModResult {
        let mut dispatched = Dispatched::default();
        let result = self.install(&mut dispatched, interrupt);
        if result.is_success() {
            debug!("{}: installed {} entries", self.describe(), self.flow.entries().len());
        } else {
            self.rollback(dispatched);
        }
        result
    }

    fn finish(&mut self) {
        for request_id in self.requests.drain(..) {
            self.manager.unregister(request_id);
        }
    }

    fn discard(&mut self) {
        // nothing reached a switch, only the record is left
        self.forget();
        self.finish();
    }
}

/// Deadlines of a removal. Ingress entries go first under a fraction of the
/// budget so traffic stops entering the flows quickly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveBudget {
    pub local: Duration,
    pub remote: Duration,
    pub divisor: u32,
}

impl RemoveBudget {
    pub fn new(config: &Config, remover: &FlowRemover) -> Self {
        let remote = if remover.is_bulk() {
            config.remote_bulk_flow_mod_timeout()
        } else {
            config.remote_flow_mod_timeout()
        };
        Self {
            local: config.flow_mod_timeout(),
            remote,
            divisor: config.ingress_remove_divisor.max(1),
        }
    }

    /// Local and remote timeout of the ingress phase.
    pub fn ingress(&self) -> (Duration, Duration) {
        (self.local / self.divisor, self.remote / self.divisor)
    }

    /// Local and remote timeout of the transit phase.
    pub fn transit(&self) -> (Duration, Duration) {
        (self.local, self.remote)
    }
}

pub struct FlowRemoveTask {
    manager: Arc<VtnManager>,
    remover: FlowRemover,
    requests: Vec<u64>,
}

impl FlowRemoveTask {
    pub fn new(manager: Arc<VtnManager>, remover: FlowRemover) -> Self {
        Self {
            manager,
            remover,
            requests: Vec::new(),
        }
    }

    fn uninstall(
        &mut self,
        entries: Vec<FlowEntry>,
        local_timeout: Duration,
        remote_timeout: Duration,
        interrupt: &Interrupt,
    ) -> FlowModResult {
        if entries.is_empty() {
            return FlowModResult::Succeeded;
        }
        let manager = self.manager.clone();
        let Partition {
            local,
            remote,
            disconnected,
        } = partition(manager.collaborators().locality.as_ref(), &entries);
        for node in disconnected {
            // entries went away with the switch
            trace!("{}: skip disconnected {}", self.describe(), node);
        }

        let futures: Vec<_> = local
            .into_iter()
            .map(|entry| {
                let name = entry.name.clone();
                (name, manager.dispatch_local(FlowModOperation::Remove, entry))
            })
            .collect();
        let request = if remote.is_empty() {
            None
        } else {
            let request = manager.dispatch_remote(FlowModOperation::Remove, remote);
            self.requests.push(request.request_id());
            Some(request)
        };

        let mut outcome = FlowModResult::Succeeded;
        let deadline = Instant::now() + local_timeout;
        for (name, future) in futures {
            let result = future.result(Some(deadline), interrupt);
            if !result.is_success() {
                warn!("{}: uninstall {}: {:?}", self.describe(), name, result);
                if outcome.is_success() {
                    outcome = result;
                }
            }
        }
        if let Some(request) = request {
            let deadline = Instant::now() + remote_timeout;
            if !request.get_result_abs(deadline, true, interrupt) && outcome.is_success() {
                outcome = request.outcome().unwrap_or(FlowModResult::Failed);
            }
        }
        outcome
    }
}

impl FlowModJob for FlowRemoveTask {
    fn describe(&self) -> String {
        format!("remove {}", self.remover)
    }

    fn execute(&mut self, interrupt: &Interrupt) -> FlowModResult {
        let flows = match self.manager.flow_db().remove_matching(&self.remover) {
            Ok(flows) => flows,
            Err(err) => {
                error!("{}: {}", self.describe(), err);
                return FlowModResult::Failed;
            }
        };
        if flows.is_empty() {
            trace!("{}: nothing to remove", self.describe());
            return FlowModResult::Succeeded;
        }

        let budget = RemoveBudget::new(self.manager.config(), &self.remover);
        let ingress = flows
            .iter()
            .filter_map(|flow| flow.ingress().cloned())
            .collect();
        let transit = flows
            .iter()
            .flat_map(|flow| flow.transit().iter().cloned())
            .collect();
        let (local, remote) = budget.ingress();
        let first = self.uninstall(ingress, local, remote, interrupt);
        let (local, remote) = budget.transit();
        let rest = self.uninstall(transit, local, remote, interrupt);

        info!("{}: {} flows removed", self.describe(), flows.len());
        if !first.is_success() {
            first
        } else {
            rest
        }
    }

    fn finish(&mut self) {
        for request_id in self.requests.drain(..) {
            self.manager.unregister(request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, thread};

    use super::*;
    use crate::{
        cluster::SwitchError,
        common::{MacVlan, SwitchPort},
        config::Config,
        flow::{FlowAction, FlowMatch, L2Host},
        simulated::{Cluster, SwitchOp},
        tests::TRACING,
    };

    fn config() -> Config {
        Config {
            flow_mod_timeout: 1000,
            remote_flow_mod_timeout: 1000,
            remote_bulk_flow_mod_timeout: 3000,
            ..Config::default()
        }
    }

    /// Three members, member 0 owns switches 1-3, member 1 owns 4-5, member 2
    /// owns 6.
    fn cluster() -> Cluster {
        let cluster = Cluster::new("default", 3, config());
        for node in 1..=3 {
            cluster.connect(NodeId(node), 0);
        }
        for node in 4..=5 {
            cluster.connect(NodeId(node), 1);
        }
        cluster.connect(NodeId(6), 2);
        cluster
    }

    fn path(manager: &VtnManager, tenant: &str, nodes: &[u64]) -> VTNFlow {
        let mut flow = manager.new_flow(tenant).with_hosts(
            L2Host {
                host: MacVlan::new(0xa, 0),
                port: SwitchPort::new(NodeId(nodes[0]), 1),
            },
            L2Host {
                host: MacVlan::new(0xb, 0),
                port: SwitchPort::new(NodeId(*nodes.last().unwrap()), 2),
            },
        );
        for node in nodes {
            flow.add_entry(
                NodeId(*node),
                FlowMatch {
                    dst_mac: Some(crate::common::MacAddress(0xb)),
                    ..Default::default()
                },
                vec![FlowAction::Output(2)],
                manager.config().l2_flow_priority(),
            );
        }
        flow
    }

    fn wait(future: &FlowModFuture) -> FlowModResult {
        future.result(
            Some(Instant::now() + Duration::from_secs(10)),
            &Interrupt::default(),
        )
    }

    #[test]
    fn ingress_installed_last() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        let flow = path(&manager, "vtn1", &[1, 2, 3, 4, 6]);
        let names: BTreeSet<_> = flow.entries().iter().map(|e| e.name.clone()).collect();
        let ingress = flow.ingress().unwrap().name.clone();
        let future = manager.install_flow(flow.clone()).unwrap();
        assert_eq!(wait(&future), FlowModResult::Succeeded);

        assert_eq!(cluster.installed().keys().cloned().collect::<BTreeSet<_>>(), names);
        let log = cluster.switch_log();
        let last = log.iter().rposition(|op| op.name == ingress).unwrap();
        assert!(log[..last]
            .iter()
            .all(|op| op.operation == FlowModOperation::Add && op.name != ingress));
        assert_eq!(log.len(), names.len());
        assert_eq!(manager.flow_db().get(&flow.group_id), Some(flow));
        assert_eq!(manager.outstanding_requests(), 0);
    }

    #[test]
    fn one_failure_rolls_back_everything() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        let flow = path(&manager, "vtn1", &[1, 2, 4, 5, 6]);
        cluster
            .member(1)
            .switches
            .fail(&flow.entries()[3].name, SwitchError::Rejected("table full".to_string()));
        let future = manager.install_flow(flow.clone()).unwrap();
        assert_eq!(wait(&future), FlowModResult::Failed);

        assert!(cluster.installed().is_empty());
        assert_eq!(manager.flow_db().get(&flow.group_id), None);
        let ingress = &flow.ingress().unwrap().name;
        assert!(!cluster
            .switch_log()
            .iter()
            .any(|op| op.name == *ingress && op.operation == FlowModOperation::Add));
        assert_eq!(manager.outstanding_requests(), 0);
    }

    #[test]
    fn local_failure_rolls_back() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        let flow = path(&manager, "vtn1", &[1, 2, 3]);
        cluster
            .member(0)
            .switches
            .fail(&flow.entries()[2].name, SwitchError::Timeout);
        let future = manager.install_flow(flow.clone()).unwrap();
        assert_eq!(wait(&future), FlowModResult::TimedOut);
        assert!(cluster.installed().is_empty());
        assert!(manager.flow_db().is_empty());
    }

    #[test]
    fn unowned_switch_is_orphaned() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        // every member believes another one owns switch 7
        cluster.orphan(NodeId(7));
        let flow = path(&manager, "vtn1", &[1, 2, 7]);
        let future = manager.install_flow(flow.clone()).unwrap();
        assert_eq!(wait(&future), FlowModResult::Failed);
        assert!(cluster.installed().is_empty());
        assert!(manager.flow_db().is_empty());
    }

    #[test]
    fn rejected_before_network() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        let remote_ingress = path(&manager, "vtn1", &[4, 1]);
        assert!(matches!(
            manager.install_flow(remote_ingress),
            Err(Error::Fatal(_))
        ));
        let disconnected = path(&manager, "vtn1", &[1, 9]);
        assert!(matches!(
            manager.install_flow(disconnected),
            Err(Error::Fatal(_))
        ));
        let empty = manager.new_flow("vtn1");
        assert!(matches!(manager.install_flow(empty), Err(Error::Fatal(_))));
        assert!(cluster.switch_log().is_empty());
        assert!(manager.flow_db().is_empty());
    }

    #[test]
    fn remove_ingress_first() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        let flows: Vec<_> = [[1, 2, 4], [2, 3, 6]]
            .iter()
            .map(|nodes| path(&manager, "vtn1", nodes))
            .collect();
        for flow in &flows {
            assert_eq!(
                wait(&manager.install_flow(flow.clone()).unwrap()),
                FlowModResult::Succeeded
            );
        }
        let other = path(&manager, "vtn2", &[3, 5]);
        wait(&manager.install_flow(other.clone()).unwrap());
        cluster.clear_switch_log();

        let future = manager.remove_flows(FlowRemover::Tenant("vtn1".to_string()));
        assert_eq!(wait(&future), FlowModResult::Succeeded);
        assert_eq!(manager.flow_db().len(), 1);
        assert_eq!(cluster.installed().len(), other.entries().len());

        let log = cluster.switch_log();
        assert_eq!(log.len(), 6);
        let ingress: BTreeSet<_> = flows
            .iter()
            .map(|flow| flow.ingress().unwrap().name.clone())
            .collect();
        assert!(log[..2].iter().all(|op| ingress.contains(&op.name)));
        assert!(log
            .iter()
            .all(|op: &SwitchOp| op.operation == FlowModOperation::Remove));
    }

    #[test]
    fn remove_failure_is_not_compensated() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        let flow = path(&manager, "vtn1", &[1, 4]);
        wait(&manager.install_flow(flow.clone()).unwrap());
        cluster
            .member(1)
            .switches
            .fail(&flow.entries()[1].name, SwitchError::Undefined);
        let future = manager.remove_flows(FlowRemover::Group(flow.group_id.clone()));
        assert_eq!(wait(&future), FlowModResult::Failed);
        assert!(manager.flow_db().is_empty());
        assert_eq!(cluster.installed().len(), 1);
    }

    #[test]
    fn refused_add_leaves_no_record() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        manager.pool().shutdown();
        let flow = path(&manager, "vtn1", &[1, 2]);
        let future = manager.install_flow(flow).unwrap();
        assert_eq!(wait(&future), FlowModResult::Failed);
        assert!(manager.flow_db().is_empty());
        assert!(cluster.switch_log().is_empty());
    }

    #[test]
    fn refusing_owner_answers_failed() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        cluster.member(1).manager.pool().shutdown();
        let flow = path(&manager, "vtn1", &[1, 4]);
        let start = Instant::now();
        let future = manager.install_flow(flow).unwrap();
        assert_eq!(wait(&future), FlowModResult::Failed);
        // answered, not left to the remote deadline
        assert!(start.elapsed() < Duration::from_millis(900));
        assert!(cluster.installed().is_empty());
        assert!(manager.flow_db().is_empty());
    }

    #[test]
    fn queued_add_discarded_on_terminate() {
        *TRACING;
        let cluster = Cluster::new(
            "default",
            1,
            Config {
                task_pool_size: 2,
                ..config()
            },
        );
        cluster.connect(NodeId(1), 0);
        cluster.connect(NodeId(2), 0);
        let manager = cluster.member(0).manager.clone();
        for _ in 0..2 {
            manager.pool().submit(|interrupt| {
                while !interrupt.is_interrupted() {
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
        let flow = path(&manager, "vtn1", &[1, 2]);
        let future = manager.install_flow(flow).unwrap();
        assert_eq!(manager.flow_db().len(), 1);
        manager.pool().terminate();
        assert_eq!(wait(&future), FlowModResult::Failed);
        assert!(manager.flow_db().is_empty());
        assert!(cluster.installed().is_empty());
    }

    #[test]
    fn interrupted_add_rolls_back_on_its_own_thread() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        cluster
            .member(0)
            .switches
            .set_delay(Duration::from_millis(100));
        let flow = path(&manager, "vtn1", &[1, 2, 3]);
        let future = manager.install_flow(flow).unwrap();
        thread::sleep(Duration::from_millis(50));
        manager.pool().terminate();
        assert_eq!(wait(&future), FlowModResult::Interrupted);
        assert!(cluster.installed().is_empty());
        assert!(manager.flow_db().is_empty());
    }

    #[test]
    fn ingress_removal_budget() {
        let config = config();
        let budget = RemoveBudget::new(&config, &FlowRemover::Tenant("vtn1".to_string()));
        assert_eq!(
            budget.ingress(),
            (Duration::from_millis(250), Duration::from_millis(750))
        );
        assert_eq!(
            budget.transit(),
            (Duration::from_millis(1000), Duration::from_millis(3000))
        );
        let all = RemoveBudget::new(&config, &FlowRemover::All);
        assert!(all.ingress().0 <= all.transit().0);
        assert!(all.ingress().1 <= all.transit().1);
    }

    #[test]
    fn slow_ingress_removal_times_out() {
        *TRACING;
        let cluster = cluster();
        let manager = cluster.member(0).manager.clone();
        let flow = path(&manager, "vtn1", &[1, 4]);
        assert_eq!(
            wait(&manager.install_flow(flow.clone()).unwrap()),
            FlowModResult::Succeeded
        );
        // within the transit deadline, beyond a quarter of it
        cluster
            .member(0)
            .switches
            .set_delay(Duration::from_millis(600));
        let start = Instant::now();
        let future = manager.remove_flows(FlowRemover::Group(flow.group_id.clone()));
        assert_eq!(wait(&future), FlowModResult::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(600));
        assert!(manager.flow_db().is_empty());
    }

    #[test]
    fn concurrent_adds() {
        *TRACING;
        let cluster = cluster();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let manager = cluster.member(0).manager.clone();
                thread::spawn(move || {
                    let flow = path(&manager, &format!("vtn{}", i % 2), &[1, 2, 4, 6]);
                    wait(&manager.install_flow(flow).unwrap())
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), FlowModResult::Succeeded);
        }
        assert_eq!(cluster.member(0).manager.flow_db().len(), 4);
        assert_eq!(cluster.installed().len(), 16);
    }
}
