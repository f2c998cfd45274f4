//! Growable blocking worker pool.
//!
//! One primary worker lives as long as the pool. Up to `size - 1` transient
//! workers are spawned when tasks queue up faster than idle workers can take
//! them, and exit after `keep_alive` without work. Tasks run on plain OS
//! threads and may block, which is what the orchestrators rely on: they wait
//! for flow-mod tasks executed by sibling workers.
//!
//! The queue is a crossbeam channel. Shutdown drops the only sender, so
//! workers drain what is queued and then observe disconnection; terminate
//! additionally empties the queue and interrupts every worker.

use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace, warn};

use crate::{
    latency::{Latency, LatencySummary},
    wait::{lock, wait_until, Interrupt, Wait},
};

pub type Task = Box<dyn FnOnce(&Interrupt) + Send>;

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    size: usize,
    keep_alive: Duration,
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    workers: Mutex<Workers>,
    exited: Condvar,
    latency: Mutex<Latency>,
}

#[derive(Default)]
struct Workers {
    alive: HashMap<usize, Interrupt>,
    idle: usize,
    next_id: usize,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize, keep_alive: Duration) -> Self {
        let (sender, receiver) = channel::unbounded();
        let pool = Self {
            inner: Arc::new(Inner {
                name: name.into(),
                size: size.max(1),
                keep_alive,
                sender: Mutex::new(Some(sender)),
                receiver,
                workers: Mutex::new(Workers::default()),
                exited: Condvar::new(),
                latency: Mutex::new(Latency::default()),
            }),
        };
        let mut workers = lock(&pool.inner.workers);
        pool.inner.spawn(&mut workers);
        drop(workers);
        pool
    }

    /// Queue a task. Returns false when the pool no longer accepts work; the
    /// caller must treat that as a failure of whatever the task was for.
    pub fn submit(&self, task: impl FnOnce(&Interrupt) + Send + 'static) -> bool {
        let sender = lock(&self.inner.sender);
        let sender = if let Some(sender) = &*sender {
            sender
        } else {
            warn!("{}: task rejected after shutdown", self.inner.name);
            return false;
        };
        if sender.send(Box::new(task)).is_err() {
            return false;
        }

        let mut workers = lock(&self.inner.workers);
        if sender.len() > workers.idle && workers.alive.len() < self.inner.size {
            self.inner.spawn(&mut workers);
        }
        true
    }

    /// Stop accepting tasks. Queued and running tasks still complete.
    pub fn shutdown(&self) -> bool {
        let running = lock(&self.inner.sender).take().is_some();
        if running {
            debug!("{}: shutdown", self.inner.name);
        }
        running
    }

    /// Shutdown, discard queued tasks and interrupt every worker.
    pub fn terminate(&self) {
        self.shutdown();
        let mut discarded = 0;
        while self.inner.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        let workers = lock(&self.inner.workers);
        for interrupt in workers.alive.values() {
            interrupt.interrupt();
        }
        debug!(
            "{}: terminate, {} queued tasks discarded, {} workers interrupted",
            self.inner.name,
            discarded,
            workers.alive.len()
        );
    }

    /// Shutdown and wait up to `timeout` for every worker to exit.
    pub fn join(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = Instant::now() + timeout;
        let exited = wait_until(
            &self.inner.workers,
            &self.inner.exited,
            Some(deadline),
            &Interrupt::default(),
            |workers| workers.alive.is_empty().then(|| ()),
        );
        matches!(exited, Wait::Ready(()))
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.inner.workers).alive.len()
    }

    pub fn latency(&self) -> LatencySummary {
        lock(&self.inner.latency).summary()
    }
}

impl Inner {
    fn spawn(self: &Arc<Self>, workers: &mut Workers) {
        let id = workers.next_id;
        let interrupt = Interrupt::default();
        let inner = self.clone();
        let worker_interrupt = interrupt.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || inner.run_worker(id, worker_interrupt));
        match spawned {
            Ok(_) => {
                workers.next_id += 1;
                workers.alive.insert(id, interrupt);
                trace!("{}: worker {} started", self.name, id);
            }
            Err(err) => error!("{}: cannot start worker: {}", self.name, err),
        }
    }

    fn run_worker(&self, id: usize, interrupt: Interrupt) {
        let primary = id == 0;
        let mut latency = lock(&self.latency).local();
        loop {
            lock(&self.workers).idle += 1;
            let received = if primary {
                self.receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                self.receiver.recv_timeout(self.keep_alive)
            };
            // `submit` decides whether to spawn under the same lock, so a task
            // queued after this worker deregistered gets a new worker
            let mut workers = lock(&self.workers);
            workers.idle -= 1;
            let task = match received {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) if !self.receiver.is_empty() => continue,
                Err(err) => {
                    if err == RecvTimeoutError::Timeout {
                        trace!("{}: worker {} idle, exit", self.name, id);
                    }
                    workers.alive.remove(&id);
                    self.exited.notify_all();
                    return;
                }
            };
            drop(workers);

            let measure = latency.measure();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(&interrupt))) {
                error!(
                    "{}: uncaught panic in task: {}",
                    self.name,
                    panic_message(&*payload)
                );
            }
            latency += measure;
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    use super::*;
    use crate::tests::TRACING;

    #[test]
    fn runs_tasks() {
        *TRACING;
        let pool = WorkerPool::new("test", 4, Duration::from_secs(1));
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            assert!(pool.submit(move |_| tx.send(i).unwrap()));
        }
        let mut received: Vec<_> = (0..10).map(|_| rx.recv().unwrap()).collect();
        received.sort_unstable();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
        assert!(pool.join(Duration::from_secs(1)));
    }

    #[test]
    fn grows_to_size_and_shrinks() {
        *TRACING;
        let pool = WorkerPool::new("test", 3, Duration::from_millis(50));
        let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let release_rx = release_rx.clone();
            let started = started.clone();
            pool.submit(move |_| {
                started.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.recv();
            });
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.worker_count(), 3);
        assert_eq!(started.load(Ordering::SeqCst), 3);
        drop(release_tx);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(started.load(Ordering::SeqCst), 5);
        assert_eq!(pool.worker_count(), 1);
        assert!(pool.join(Duration::from_secs(1)));
    }

    #[test]
    fn expiring_worker_never_strands_a_task() {
        *TRACING;
        let pool = WorkerPool::new("test", 2, Duration::from_millis(10));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.submit(move |_| {
            let _ = gate_rx.recv();
        });
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            // land right around the keep-alive expiry
            thread::sleep(Duration::from_millis(10));
            let tx = tx.clone();
            assert!(pool.submit(move |_| tx.send(i).unwrap()));
            assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), i);
        }
        gate_tx.send(()).unwrap();
        assert!(pool.join(Duration::from_secs(1)));
    }

    #[test]
    fn panic_does_not_kill_worker() {
        *TRACING;
        let pool = WorkerPool::new("test", 1, Duration::from_secs(1));
        pool.submit(|_| panic!("task failure"));
        let (tx, rx) = mpsc::channel();
        pool.submit(move |_| tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pool.worker_count(), 1);
        pool.terminate();
    }

    #[test]
    fn shutdown_runs_queued_tasks() {
        *TRACING;
        let pool = WorkerPool::new("test", 1, Duration::from_secs(1));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let done = Arc::new(AtomicUsize::new(0));
        pool.submit(move |_| {
            let _ = gate_rx.recv();
        });
        for _ in 0..3 {
            let done = done.clone();
            assert!(pool.submit(move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.shutdown());
        assert!(!pool.submit(|_| {}));
        gate_tx.send(()).unwrap();
        assert!(pool.join(Duration::from_secs(1)));
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn terminate_discards_and_interrupts() {
        *TRACING;
        let pool = WorkerPool::new("test", 1, Duration::from_secs(1));
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(move |interrupt| {
            started_tx.send(()).unwrap();
            while !interrupt.is_interrupted() {
                thread::sleep(Duration::from_millis(1));
            }
        });
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            pool.submit(move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        started_rx.recv().unwrap();
        pool.terminate();
        assert!(!pool.submit(|_| {}));
        let deadline = Instant::now() + Duration::from_secs(1);
        while !pool.join(Duration::ZERO) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }
}
