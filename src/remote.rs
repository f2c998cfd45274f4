//! Aggregation of per-entry acknowledgements from remote cluster members.
//!
//! A [`RemoteFlowRequest`] is created with the names of the flow entries sent
//! to the other members. Every member answers for every entry: the owner of
//! the switch with the outcome, the others with `Ignored`. An entry moves out
//! of the pending set when its owner answers, or becomes orphaned once every
//! remote member ignored it, which means nobody in the cluster owns the switch.
//!
//! The number of remote members is passed with every answer and assumed stable
//! for the lifetime of one request. A membership change in the middle of a
//! request can leave an orphan undetected until the deadline.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Condvar, Mutex},
    time::Instant,
};

use tracing::{debug, error, trace};

use crate::{
    task::FlowModResult,
    wait::{lock, wait_until, Interrupt, Wait},
};

pub struct RemoteFlowRequest {
    request_id: u64,
    state: Mutex<RequestState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct RequestState {
    pending: BTreeSet<String>,
    succeeded: BTreeSet<String>,
    failed: BTreeSet<String>,
    orphaned: BTreeSet<String>,
    ignored: HashMap<String, usize>,
    outcome: Option<FlowModResult>,
}

impl RequestState {
    fn is_failed(&self) -> bool {
        !self.failed.is_empty() || !self.orphaned.is_empty()
    }

    fn settled(&self, wait_for_all: bool) -> Option<FlowModResult> {
        if let Some(outcome) = self.outcome {
            return Some(outcome);
        }
        if self.is_failed() && (!wait_for_all || self.pending.is_empty()) {
            Some(FlowModResult::Failed)
        } else if self.pending.is_empty() {
            Some(FlowModResult::Succeeded)
        } else {
            None
        }
    }
}

impl RemoteFlowRequest {
    pub fn new(request_id: u64, names: impl IntoIterator<Item = String>) -> Self {
        Self {
            request_id,
            state: Mutex::new(RequestState {
                pending: names.into_iter().collect(),
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Record one member's answer for `name`. Returns false if the entry was
    /// not pending, i.e. unknown or already settled.
    pub fn set_result(
        &self,
        name: &str,
        result: FlowModResult,
        total_remote_nodes: usize,
    ) -> bool {
        let mut state = lock(&self.state);
        if !state.pending.contains(name) {
            trace!(
                "request {}: late or unknown result {:?} for {}",
                self.request_id,
                result,
                name
            );
            return false;
        }
        match result {
            FlowModResult::Ignored => {
                let count = state.ignored.entry(name.to_string()).or_insert(0);
                *count += 1;
                if *count < total_remote_nodes {
                    return true;
                }
                state.pending.remove(name);
                state.orphaned.insert(name.to_string());
                debug!("request {}: {} orphaned", self.request_id, name);
            }
            FlowModResult::Succeeded => {
                state.pending.remove(name);
                state.succeeded.insert(name.to_string());
            }
            _ => {
                state.pending.remove(name);
                state.failed.insert(name.to_string());
                debug!("request {}: {} {:?}", self.request_id, name, result);
            }
        }
        // failures wake fail-fast waiters, an empty pending set wakes the rest
        if state.pending.is_empty() || state.is_failed() {
            self.cond.notify_all();
        }
        true
    }

    /// Wait for the aggregate outcome until `deadline`. Without
    /// `wait_for_all` the first failed or orphaned entry settles the request
    /// right away; with it every entry has to be answered first. The outcome
    /// is computed once and returned to every later caller.
    pub fn get_result_abs(
        &self,
        deadline: Instant,
        wait_for_all: bool,
        interrupt: &Interrupt,
    ) -> bool {
        let settled = wait_until(&self.state, &self.cond, Some(deadline), interrupt, |state| {
            state.settled(wait_for_all)
        });
        let outcome = match settled {
            Wait::Ready(outcome) => outcome,
            Wait::TimedOut => FlowModResult::TimedOut,
            Wait::Interrupted => FlowModResult::Interrupted,
        };

        let mut state = lock(&self.state);
        let outcome = *state.outcome.get_or_insert(outcome);
        if outcome != FlowModResult::Succeeded {
            self.report(&state, outcome);
        }
        outcome == FlowModResult::Succeeded
    }

    /// Wait until every entry got its final answer, whatever the outcome.
    /// Leaves the memoized outcome alone.
    pub fn wait_pending(&self, deadline: Instant, interrupt: &Interrupt) -> bool {
        wait_until(&self.state, &self.cond, Some(deadline), interrupt, |state| {
            state.pending.is_empty().then(|| ())
        })
        .ready()
        .is_some()
    }

    pub fn outcome(&self) -> Option<FlowModResult> {
        lock(&self.state).outcome
    }

    pub fn succeeded(&self) -> BTreeSet<String> {
        lock(&self.state).succeeded.clone()
    }

    fn report(&self, state: &RequestState, outcome: FlowModResult) {
        let ignored: BTreeSet<_> = state
            .ignored
            .iter()
            .filter(|(name, _)| state.pending.contains(*name))
            .map(|(name, count)| format!("{}({})", name, count))
            .collect();
        error!(
            request = self.request_id,
            ?outcome,
            succeeded = ?state.succeeded,
            failed = ?state.failed,
            orphaned = ?state.orphaned,
            no_response = ?state.pending,
            ignored = ?ignored,
            "remote flow modification failed"
        );
    }
}
