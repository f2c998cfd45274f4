//! Per-container manager and the registry that owns all of them.
//!
//! A [`VtnManager`] bundles everything one virtualization container needs on
//! one cluster member: configuration, the worker pool, the flow database, MAC
//! tables, the manager lock, the table of outstanding remote requests, and the
//! collaborators. Mapping changes are applied with an explicit
//! [`RequestContext`] that collects the flow removals they imply; the
//! removals are dispatched once the change is complete, with [`VtnManager::commit`].

use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    cache::TransactionalCache,
    cleaner::MapCleaner,
    cluster::{ClusterEvent, Collaborators, Destination, FlowModOperation, Locality},
    common::{deserialize, serialize, MacVlan, MemberId, SwitchPort},
    config::Config,
    error::{Error, Result},
    flow::{FlowEntry, VTNFlow},
    flowdb::{FlowCache, FlowDatabase, FlowRemover},
    lock::{LockStack, ManagerLock},
    mac::{BridgePath, MacTables},
    orchestrate::{validate, FlowAddTask, FlowRemoveTask},
    pool::WorkerPool,
    remote::RemoteFlowRequest,
    task::{FlowEntryJob, FlowModFuture, FlowModJob, FlowModResult, FlowModTask},
    wait::{lock, Interrupt},
};

/// Scratch state of one mapping-change request.
#[derive(Debug, Default)]
pub struct RequestContext {
    removals: Vec<FlowRemover>,
    mode_changed: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a flow removal to run after the request completes.
    pub fn add_removal(&mut self, remover: FlowRemover) {
        self.removals.push(remover);
    }

    pub fn removals(&self) -> &[FlowRemover] {
        &self.removals
    }

    /// The container switched mapping mode, every learned host and every flow
    /// is stale.
    pub fn set_mode_changed(&mut self) {
        self.mode_changed = true;
    }

    pub fn is_mode_changed(&self) -> bool {
        self.mode_changed
    }
}

pub struct VtnManager {
    container: String,
    config: Config,
    pool: WorkerPool,
    db: FlowDatabase,
    mac_tables: MacTables,
    lock: Arc<ManagerLock>,
    collaborators: Collaborators,
    requests: Mutex<HashMap<u64, Arc<RemoteFlowRequest>>>,
    next_request: AtomicU64,
}

impl VtnManager {
    pub fn new(
        container: impl Into<String>,
        config: Config,
        cache: Arc<FlowCache>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let container = container.into();
        let member = collaborators.channel.local_member();
        let pool = WorkerPool::new(
            format!("{}-{}", container, member),
            config.task_pool_size as _,
            config.task_keep_alive(),
        );
        let db = FlowDatabase::new(
            TransactionalCache::new(cache, config.cache_transaction_timeout()),
            member,
        );
        info!("{}: manager started on member {}", container, member);
        Arc::new(Self {
            container,
            config,
            pool,
            db,
            mac_tables: MacTables::default(),
            lock: Arc::default(),
            collaborators,
            requests: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn flow_db(&self) -> &FlowDatabase {
        &self.db
    }

    pub fn mac_tables(&self) -> &MacTables {
        &self.mac_tables
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn member(&self) -> MemberId {
        self.collaborators.channel.local_member()
    }

    /// Empty flow for `tenant` with a fresh group id.
    pub fn new_flow(&self, tenant: &str) -> VTNFlow {
        VTNFlow::new(self.db.next_group_id(tenant))
    }

    /// Record a MAC address learned on a bridge.
    pub fn learn(
        &self,
        bridge: &BridgePath,
        host: MacVlan,
        port: SwitchPort,
        inet: Option<Ipv4Addr>,
    ) {
        let mut tables = self.mac_tables.lock();
        if tables
            .entry(bridge.clone())
            .or_default()
            .learn(host, port, inet)
        {
            trace!("{}: learned {}@{} on {}", bridge, host.mac, host.vlan, port);
        }
    }

    /// Store `flow` and start installing it. A flow without entries, with an
    /// ingress switch owned by another member or crossing a disconnected
    /// switch is rejected before anything is touched.
    pub fn install_flow(self: &Arc<Self>, flow: VTNFlow) -> Result<Arc<FlowModFuture>> {
        if let Err(err) = validate(&flow, self.collaborators.locality.as_ref()) {
            error!("{}: {}", self.container, err);
            return Err(err);
        }
        {
            let mut locks = LockStack::new();
            locks.push(self.lock.read_arc());
            self.db.add(&flow)?;
        }
        Ok(FlowModTask::new(FlowAddTask::new(self.clone(), flow)).submit(&self.pool))
    }

    pub fn remove_flows(self: &Arc<Self>, remover: FlowRemover) -> Arc<FlowModFuture> {
        FlowModTask::new(FlowRemoveTask::new(self.clone(), remover)).submit(&self.pool)
    }

    /// Evict state made stale by a mapping change. Flow removals are queued in
    /// `context` until [`commit`](Self::commit).
    pub fn purge(&self, cleaner: &MapCleaner, context: &mut RequestContext, tenant: &str) -> usize {
        let mut locks = LockStack::new();
        locks.push(self.lock.write_arc());
        cleaner.purge(self, context, tenant)
    }

    /// Dispatch what a finished request queued.
    pub fn commit(self: &Arc<Self>, context: RequestContext) -> Vec<Arc<FlowModFuture>> {
        let RequestContext {
            removals,
            mode_changed,
        } = context;
        if mode_changed {
            info!("{}: mapping mode changed, purge everything", self.container);
            let flushed = {
                let mut locks = LockStack::new();
                locks.push(self.lock.write_arc());
                self.mac_tables.flush(None, |_| true).len()
            };
            debug!("{}: {} MAC entries flushed", self.container, flushed);
            return vec![self.remove_flows(FlowRemover::All)];
        }
        removals
            .into_iter()
            .map(|remover| self.remove_flows(remover))
            .collect()
    }

    /// Handle an encoded [`ClusterEvent`] from `source`.
    pub fn receive(self: &Arc<Self>, source: MemberId, buffer: &[u8]) -> Result<()> {
        let event: ClusterEvent = deserialize(buffer).map_err(|err| {
            warn!("{}: malformed message from member {}", self.container, source);
            err
        })?;
        match event {
            ClusterEvent::FlowMod {
                request_id,
                origin,
                operation,
                entries,
            } => {
                for entry in entries {
                    self.handle_remote_entry(request_id, origin, operation, entry);
                }
            }
            ClusterEvent::FlowModResult {
                request_id,
                name,
                result,
            } => {
                let request = lock(&self.requests).get(&request_id).cloned();
                if let Some(request) = request {
                    let total = self.collaborators.channel.remote_members();
                    request.set_result(&name, result, total);
                } else {
                    trace!(
                        "{}: result for finished request {} from member {}",
                        self.container,
                        request_id,
                        source
                    );
                }
            }
        }
        Ok(())
    }

    fn handle_remote_entry(
        self: &Arc<Self>,
        request_id: u64,
        origin: MemberId,
        operation: FlowModOperation,
        entry: FlowEntry,
    ) {
        if self.collaborators.locality.locality(entry.node) != Locality::Local {
            self.reply(origin, request_id, entry.name, FlowModResult::Ignored);
            return;
        }
        let job = RemoteEntryJob {
            job: self.entry_job(operation, entry),
            manager: self.clone(),
            origin,
            request_id,
            result: FlowModResult::Failed,
        };
        FlowModTask::new(job).submit(&self.pool);
    }

    fn reply(&self, origin: MemberId, request_id: u64, name: String, result: FlowModResult) {
        let event = ClusterEvent::FlowModResult {
            request_id,
            name,
            result,
        };
        self.collaborators
            .channel
            .post(Destination::Member(origin), serialize(&event));
    }

    fn entry_job(&self, operation: FlowModOperation, entry: FlowEntry) -> FlowEntryJob {
        FlowEntryJob {
            operation,
            entry,
            switch: self.collaborators.switch.clone(),
            inventory: self.collaborators.inventory.clone(),
        }
    }

    pub(crate) fn entry_task(&self, operation: FlowModOperation, entry: FlowEntry) -> FlowModTask {
        FlowModTask::new(self.entry_job(operation, entry))
    }

    /// Run one flow-mod on a local switch through the pool.
    pub(crate) fn dispatch_local(
        &self,
        operation: FlowModOperation,
        entry: FlowEntry,
    ) -> Arc<FlowModFuture> {
        self.entry_task(operation, entry).submit(&self.pool)
    }

    /// Ask every other member to program `entries` and return the request
    /// their answers are collected in. The caller must
    /// [`unregister`](Self::unregister) it once done.
    pub(crate) fn dispatch_remote(
        &self,
        operation: FlowModOperation,
        entries: Vec<FlowEntry>,
    ) -> Arc<RemoteFlowRequest> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Arc::new(RemoteFlowRequest::new(
            request_id,
            entries.iter().map(|entry| entry.name.clone()),
        ));
        lock(&self.requests).insert(request_id, request.clone());
        debug!(
            "{}: remote request {} {:?} {} entries",
            self.container,
            request_id,
            operation,
            entries.len()
        );
        let event = ClusterEvent::FlowMod {
            request_id,
            origin: self.member(),
            operation,
            entries,
        };
        self.collaborators
            .channel
            .post(Destination::Broadcast, serialize(&event));
        request
    }

    pub(crate) fn unregister(&self, request_id: u64) {
        lock(&self.requests).remove(&request_id);
    }

    pub fn outstanding_requests(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Stop the pool and wait up to `timeout` for running tasks.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        info!("{}: shutdown", self.container);
        let joined = self.pool.join(timeout);
        if !joined {
            warn!("{}: tasks still running, terminate", self.container);
            self.pool.terminate();
        }
        joined
    }
}

/// Entry programmed on behalf of another member. The origin gets an answer on
/// every exit path, `Failed` unless the entry ran.
struct RemoteEntryJob {
    job: FlowEntryJob,
    manager: Arc<VtnManager>,
    origin: MemberId,
    request_id: u64,
    result: FlowModResult,
}

impl FlowModJob for RemoteEntryJob {
    fn describe(&self) -> String {
        format!("{} for member {}", self.job.describe(), self.origin)
    }

    fn execute(&mut self, interrupt: &Interrupt) -> FlowModResult {
        self.result = self.job.execute(interrupt);
        self.result
    }

    fn finish(&mut self) {
        let name = self.job.entry.name.clone();
        self.manager.reply(self.origin, self.request_id, name, self.result);
    }
}

/// Managers of every container hosted by this process.
#[derive(Default)]
pub struct Registry {
    managers: Mutex<BTreeMap<String, Arc<VtnManager>>>,
}

impl Registry {
    /// Create the manager of `container`. Fails if it already exists.
    pub fn create(
        &self,
        container: &str,
        config: Config,
        cache: Arc<FlowCache>,
        collaborators: Collaborators,
    ) -> Result<Arc<VtnManager>> {
        let mut managers = lock(&self.managers);
        if managers.contains_key(container) {
            return Err(Error::Fatal(format!("container {} already exists", container)));
        }
        let manager = VtnManager::new(container, config, cache, collaborators);
        managers.insert(container.to_string(), manager.clone());
        Ok(manager)
    }

    pub fn get(&self, container: &str) -> Option<Arc<VtnManager>> {
        lock(&self.managers).get(container).cloned()
    }

    /// Remove and shut down the manager of `container`.
    pub fn remove(&self, container: &str, timeout: Duration) -> Option<Arc<VtnManager>> {
        let manager = lock(&self.managers).remove(container)?;
        manager.shutdown(timeout);
        Some(manager)
    }

    pub fn containers(&self) -> Vec<String> {
        lock(&self.managers).keys().cloned().collect()
    }
}
