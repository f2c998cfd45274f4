//! In-process cluster for tests and the simulator binary.
//!
//! Every member gets its own [`VtnManager`], all of them share one flow cache.
//! Switch ownership is a cluster-wide table, each member sees the switches it
//! owns as local. Cluster events travel over crossbeam channels, one delivery
//! thread per member, and pass a filter table on the way that can drop or
//! delay them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rand::{thread_rng, Rng};
use tracing::{trace, warn};

use crate::{
    cluster::{
        Collaborators, Destination, EventChannel, FlowModOperation, Inventory, Locality,
        LocalityOracle, SwitchError, SwitchProgrammer,
    },
    common::{MemberId, NodeId},
    config::Config,
    flow::FlowEntry,
    flowdb::FlowCache,
    manager::VtnManager,
    wait::lock,
};

type Message = (MemberId, Vec<u8>);
type Filter = Box<dyn Fn(MemberId, MemberId, &[u8], &mut Duration) -> bool + Send>;
type FilterTable = HashMap<u32, Filter>;

/// Switch ownership. `None` marks a switch every member believes someone
/// else owns.
#[derive(Default)]
struct Ownership(Mutex<HashMap<NodeId, Option<MemberId>>>);

struct MemberLocality {
    member: MemberId,
    ownership: Arc<Ownership>,
}

impl LocalityOracle for MemberLocality {
    fn locality(&self, node: NodeId) -> Locality {
        match lock(&self.ownership.0).get(&node) {
            Some(Some(owner)) if *owner == self.member => Locality::Local,
            Some(_) => Locality::NotLocal,
            None => Locality::Disconnected,
        }
    }
}

impl Inventory for Ownership {
    fn exists(&self, node: NodeId) -> bool {
        lock(&self.0).contains_key(&node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOp {
    pub member: MemberId,
    pub operation: FlowModOperation,
    pub name: String,
    pub node: NodeId,
    pub at: Instant,
}

#[derive(Default)]
struct SwitchState {
    installed: BTreeMap<String, FlowEntry>,
    faults: HashMap<String, SwitchError>,
    delay: Duration,
}

/// Flow tables of the switches one member owns.
pub struct SimulatedSwitches {
    member: MemberId,
    state: Mutex<SwitchState>,
    log: Arc<Mutex<Vec<SwitchOp>>>,
}

impl SimulatedSwitches {
    /// Make every operation on entry `name` fail with `error`.
    pub fn fail(&self, name: &str, error: SwitchError) {
        lock(&self.state).faults.insert(name.to_string(), error);
    }

    pub fn heal(&self, name: &str) {
        lock(&self.state).faults.remove(name);
    }

    /// Latency of every switch operation.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    pub fn installed(&self) -> BTreeMap<String, FlowEntry> {
        lock(&self.state).installed.clone()
    }

    fn apply(&self, operation: FlowModOperation, entry: &FlowEntry) -> Result<(), SwitchError> {
        let delay = lock(&self.state).delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut state = lock(&self.state);
        if let Some(error) = state.faults.get(&entry.name) {
            return Err(error.clone());
        }
        match operation {
            FlowModOperation::Add => state.installed.insert(entry.name.clone(), entry.clone()),
            FlowModOperation::Remove => state.installed.remove(&entry.name),
        };
        // recorded while the table is locked, the log order is the switch order
        lock(&self.log).push(SwitchOp {
            member: self.member,
            operation,
            name: entry.name.clone(),
            node: entry.node,
            at: Instant::now(),
        });
        Ok(())
    }
}

impl SwitchProgrammer for SimulatedSwitches {
    fn install_flow_entry(&self, entry: &FlowEntry) -> Result<(), SwitchError> {
        self.apply(FlowModOperation::Add, entry)
    }

    fn uninstall_flow_entry(&self, entry: &FlowEntry) -> Result<(), SwitchError> {
        self.apply(FlowModOperation::Remove, entry)
    }
}

struct Bus {
    senders: Vec<Sender<Message>>,
    filter_table: Mutex<FilterTable>,
    closed: AtomicBool,
}

impl Bus {
    fn send(&self, source: MemberId, dest: MemberId, message: Vec<u8>) {
        let mut delay = Duration::ZERO;
        let mut drop = false;
        for filter in lock(&self.filter_table).values() {
            if !filter(source, dest, &message, &mut delay) {
                drop = true;
                break;
            }
        }
        trace!(
            "{} -> {} [message size = {}] {}",
            source,
            dest,
            message.len(),
            if drop {
                "[drop]".to_string()
            } else {
                format!("[delay = {:?}]", delay)
            }
        );
        if drop {
            return;
        }
        let tx = match self.senders.get(dest as usize) {
            Some(tx) => tx.clone(),
            None => {
                warn!("no member {}", dest);
                return;
            }
        };
        if delay.is_zero() {
            let _ = tx.send((source, message));
        } else {
            thread::spawn(move || {
                thread::sleep(delay);
                let _ = tx.send((source, message));
            });
        }
    }
}

struct BusChannel {
    member: MemberId,
    bus: Arc<Bus>,
}

impl EventChannel for BusChannel {
    fn local_member(&self) -> MemberId {
        self.member
    }

    fn remote_members(&self) -> usize {
        self.bus.senders.len() - 1
    }

    fn post(&self, destination: Destination, message: Vec<u8>) {
        match destination {
            Destination::Member(dest) => self.bus.send(self.member, dest, message),
            Destination::Broadcast => {
                for dest in 0..self.bus.senders.len() as MemberId {
                    if dest != self.member {
                        self.bus.send(self.member, dest, message.clone());
                    }
                }
            }
        }
    }
}

pub struct Member {
    pub manager: Arc<VtnManager>,
    pub switches: Arc<SimulatedSwitches>,
}

pub struct Cluster {
    members: Vec<Member>,
    ownership: Arc<Ownership>,
    bus: Arc<Bus>,
    cache: Arc<FlowCache>,
    log: Arc<Mutex<Vec<SwitchOp>>>,
    deliveries: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Members are numbered from 0.
    pub fn new(container: &str, n_member: usize, config: Config) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..n_member).map(|_| unbounded()).unzip();
        let bus = Arc::new(Bus {
            senders,
            filter_table: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let ownership = Arc::new(Ownership::default());
        let cache = Arc::new(FlowCache::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let members: Vec<_> = (0..n_member as MemberId)
            .map(|member| {
                let switches = Arc::new(SimulatedSwitches {
                    member,
                    state: Mutex::default(),
                    log: log.clone(),
                });
                let collaborators = Collaborators {
                    switch: switches.clone(),
                    locality: Arc::new(MemberLocality {
                        member,
                        ownership: ownership.clone(),
                    }),
                    inventory: ownership.clone(),
                    channel: Arc::new(BusChannel {
                        member,
                        bus: bus.clone(),
                    }),
                };
                let manager =
                    VtnManager::new(container, config.clone(), cache.clone(), collaborators);
                Member { manager, switches }
            })
            .collect();

        let deliveries = receivers
            .into_iter()
            .zip(&members)
            .map(|(rx, member)| Self::deliver(rx, member.manager.clone(), bus.clone()))
            .collect();
        Self {
            members,
            ownership,
            bus,
            cache,
            log,
            deliveries,
        }
    }

    fn deliver(rx: Receiver<Message>, manager: Arc<VtnManager>, bus: Arc<Bus>) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok((source, message)) => {
                    if let Err(err) = manager.receive(source, &message) {
                        warn!("member {}: {}", manager.member(), err);
                    }
                }
                Err(RecvTimeoutError::Timeout) if !bus.closed.load(Ordering::SeqCst) => {}
                Err(_) => break,
            }
        })
    }

    pub fn member(&self, member: MemberId) -> &Member {
        &self.members[member as usize]
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn cache(&self) -> &Arc<FlowCache> {
        &self.cache
    }

    /// `member` now owns `node`.
    pub fn connect(&self, node: NodeId, member: MemberId) {
        lock(&self.ownership.0).insert(node, Some(member));
    }

    pub fn disconnect(&self, node: NodeId) {
        lock(&self.ownership.0).remove(&node);
    }

    /// `node` stays known but no member owns it.
    pub fn orphan(&self, node: NodeId) {
        lock(&self.ownership.0).insert(node, None);
    }

    /// Union of every member's switch tables.
    pub fn installed(&self) -> BTreeMap<String, FlowEntry> {
        self.members
            .iter()
            .flat_map(|member| member.switches.installed())
            .collect()
    }

    /// Every switch operation so far, in the order the switches applied them.
    pub fn switch_log(&self) -> Vec<SwitchOp> {
        lock(&self.log).clone()
    }

    pub fn clear_switch_log(&self) {
        lock(&self.log).clear();
    }

    pub fn insert_filter(
        &self,
        filter_id: u32,
        filter: impl Fn(MemberId, MemberId, &[u8], &mut Duration) -> bool + Send + 'static,
    ) {
        lock(&self.bus.filter_table).insert(filter_id, Box::new(filter));
    }

    pub fn remove_filter(&self, filter_id: u32) {
        lock(&self.bus.filter_table).remove(&filter_id);
    }

    pub fn delay(
        min: Duration,
        max: Duration,
    ) -> impl Fn(MemberId, MemberId, &[u8], &mut Duration) -> bool + Send + 'static {
        move |_, _, _, delay| {
            if min < max {
                *delay += thread_rng().gen_range(min..max);
            }
            true
        }
    }

    /// Stop delivery and every member's pool.
    pub fn shutdown(&mut self, timeout: Duration) {
        self.bus.closed.store(true, Ordering::SeqCst);
        for member in &self.members {
            member.manager.shutdown(timeout);
        }
        for delivery in self.deliveries.drain(..) {
            if delivery.join().is_err() {
                warn!("delivery thread panicked");
            }
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !self.deliveries.is_empty() {
            self.shutdown(Duration::from_secs(1));
        }
    }
}
