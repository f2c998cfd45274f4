//! Flow-mod tasks: the unit of work that installs or uninstalls flow entries.
//!
//! A [`FlowModTask`] wraps a [`FlowModJob`] and exposes its completion as a
//! shared [`FlowModFuture`]. The state machine is
//!
//! ```text
//! Created -> Running -> Done(Succeeded | Failed | TimedOut | Interrupted)
//! ```
//!
//! [`FlowModTask::run`] always ends in `Done`, a panicking job ends as
//! `Failed`, and the job's [`FlowModJob::finish`] hook runs on every exit
//! path so no coordination record outlives the task. A task dropped without
//! running, because the pool refused it or discarded it on terminate, ends
//! as `Failed` after [`FlowModJob::discard`].
//!
//! Tasks cannot be cancelled once queued: [`FlowModFuture::cancel`] is
//! accepted and has no effect. Callers must not assume cancellation frees
//! anything.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};

use serde_derive::{Deserialize, Serialize};
use tracing::{error, trace, warn, Level};

use crate::{
    cluster::{FlowModOperation, Inventory, SwitchError, SwitchProgrammer},
    flow::FlowEntry,
    pool::{panic_message, WorkerPool},
    wait::{lock, wait_until, Interrupt, Wait},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowModResult {
    Succeeded,
    Failed,
    /// This member has no jurisdiction over the switch.
    Ignored,
    TimedOut,
    Interrupted,
}

impl FlowModResult {
    pub fn is_success(self) -> bool {
        self == Self::Succeeded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Done(FlowModResult),
}

#[derive(Debug)]
pub struct FlowModFuture {
    state: Mutex<TaskState>,
    cond: Condvar,
}

impl Default for FlowModFuture {
    fn default() -> Self {
        Self {
            state: Mutex::new(TaskState::Created),
            cond: Condvar::new(),
        }
    }
}

impl FlowModFuture {
    pub fn state(&self) -> TaskState {
        *lock(&self.state)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state(), TaskState::Done(_))
    }

    /// Always false: a flow-mod task is never cancelled.
    pub fn cancel(&self) -> bool {
        false
    }

    pub fn get(&self, deadline: Option<Instant>, interrupt: &Interrupt) -> Wait<FlowModResult> {
        wait_until(&self.state, &self.cond, deadline, interrupt, |state| {
            if let TaskState::Done(result) = state {
                Some(*result)
            } else {
                None
            }
        })
    }

    /// [`get`](Self::get) with the wait outcome folded into a result.
    pub fn result(&self, deadline: Option<Instant>, interrupt: &Interrupt) -> FlowModResult {
        match self.get(deadline, interrupt) {
            Wait::Ready(result) => result,
            Wait::TimedOut => FlowModResult::TimedOut,
            Wait::Interrupted => FlowModResult::Interrupted,
        }
    }

    fn start(&self) {
        let mut state = lock(&self.state);
        if *state == TaskState::Created {
            *state = TaskState::Running;
        }
    }

    fn complete(&self, result: FlowModResult) -> bool {
        let mut state = lock(&self.state);
        if let TaskState::Done(_) = *state {
            return false;
        }
        *state = TaskState::Done(result);
        self.cond.notify_all();
        true
    }
}

pub trait FlowModJob: Send {
    fn describe(&self) -> String;

    fn execute(&mut self, interrupt: &Interrupt) -> FlowModResult;

    /// Runs after `execute` on every exit path, including a panic.
    fn finish(&mut self) {}

    /// Runs instead of `execute` when the task is dropped before it ran.
    fn discard(&mut self) {
        self.finish()
    }
}

pub struct FlowModTask {
    future: Arc<FlowModFuture>,
    job: Box<dyn FlowModJob>,
}

impl FlowModTask {
    pub fn new(job: impl FlowModJob + 'static) -> Self {
        Self {
            future: Arc::default(),
            job: Box::new(job),
        }
    }

    pub fn future(&self) -> Arc<FlowModFuture> {
        self.future.clone()
    }

    pub fn run(mut self, interrupt: &Interrupt) -> FlowModResult {
        self.future.start();
        let job = &mut self.job;
        let result = match panic::catch_unwind(AssertUnwindSafe(|| job.execute(interrupt))) {
            Ok(result) => result,
            Err(payload) => {
                error!(
                    "{}: unexpected panic: {}",
                    self.job.describe(),
                    panic_message(&*payload)
                );
                FlowModResult::Failed
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(|| self.job.finish())).is_err() {
            error!("{}: panic while finishing", self.job.describe());
        }
        self.future.complete(result);
        result
    }

    /// Queue on `pool`. A rejected task resolves as failed right away.
    pub fn submit(self, pool: &WorkerPool) -> Arc<FlowModFuture> {
        let future = self.future();
        let description = self.job.describe();
        if !pool.submit(move |interrupt| {
            self.run(interrupt);
        }) {
            error!("{}: rejected by worker pool", description);
        }
        future
    }
}

impl Drop for FlowModTask {
    fn drop(&mut self) {
        if self.future.state() != TaskState::Created {
            return;
        }
        warn!("{}: discarded before running", self.job.describe());
        let job = &mut self.job;
        if panic::catch_unwind(AssertUnwindSafe(|| job.discard())).is_err() {
            error!("{}: panic while discarding", self.job.describe());
        }
        self.future.complete(FlowModResult::Failed);
    }
}

/// Install or uninstall one flow entry on a switch owned by this member.
pub struct FlowEntryJob {
    pub operation: FlowModOperation,
    pub entry: FlowEntry,
    pub switch: Arc<dyn SwitchProgrammer>,
    pub inventory: Arc<dyn Inventory>,
}

impl FlowEntryJob {
    /// How loud a switch failure is. A switch that left while we talked to
    /// it is expected during node churn.
    pub fn failure_level(&self, err: &SwitchError) -> Level {
        match err {
            SwitchError::Rejected(_) => Level::ERROR,
            _ if !self.inventory.exists(self.entry.node) => Level::TRACE,
            _ => Level::ERROR,
        }
    }
}

impl FlowModJob for FlowEntryJob {
    fn describe(&self) -> String {
        let verb = match self.operation {
            FlowModOperation::Add => "install",
            FlowModOperation::Remove => "uninstall",
        };
        format!("{} {} on {}", verb, self.entry.name, self.entry.node)
    }

    fn execute(&mut self, _: &Interrupt) -> FlowModResult {
        let status = match self.operation {
            FlowModOperation::Add => self.switch.install_flow_entry(&self.entry),
            FlowModOperation::Remove => self.switch.uninstall_flow_entry(&self.entry),
        };
        let err = match status {
            Ok(()) => {
                trace!("{}: done", self.describe());
                return FlowModResult::Succeeded;
            }
            Err(err) => err,
        };
        if self.failure_level(&err) == Level::ERROR {
            error!("{}: {}", self.describe(), err);
        } else {
            trace!("{}: {}, switch is gone", self.describe(), err);
        }
        if err == SwitchError::Timeout {
            FlowModResult::TimedOut
        } else {
            FlowModResult::Failed
        }
    }
}
