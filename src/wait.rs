//! Blocking wait shared by every suspension point of the orchestration layer.
//!
//! Bounded and unbounded waits go through the same primitive, [`wait_until`],
//! which takes an optional deadline and reports [`Wait::Ready`],
//! [`Wait::TimedOut`] or [`Wait::Interrupted`]. Interruption is cooperative:
//! a thread owns an [`Interrupt`] handle (worker threads get one from the
//! pool) and blocked waits observe it within [`INTERRUPT_CHECK`].

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

pub const INTERRUPT_CHECK: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait<T> {
    Ready(T),
    TimedOut,
    Interrupted,
}

impl<T> Wait<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// a panicking task never leaves the protected data half-updated, every
// critical section in this crate is a plain field assignment
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block until `ready` yields a value, the deadline passes or `interrupt`
/// fires. `ready` is evaluated under the lock, so spurious wakeups only cost
/// one extra evaluation.
pub fn wait_until<S, T>(
    mutex: &Mutex<S>,
    cond: &Condvar,
    deadline: Option<Instant>,
    interrupt: &Interrupt,
    mut ready: impl FnMut(&mut S) -> Option<T>,
) -> Wait<T> {
    let mut state = lock(mutex);
    loop {
        if let Some(value) = ready(&mut state) {
            return Wait::Ready(value);
        }
        if interrupt.is_interrupted() {
            return Wait::Interrupted;
        }
        let mut slice = INTERRUPT_CHECK;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Wait::TimedOut;
            }
            slice = slice.min(deadline - now);
        }
        state = cond
            .wait_timeout(state, slice)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn slot() -> Arc<(Mutex<Option<u32>>, Condvar)> {
        Arc::new((Mutex::new(None), Condvar::new()))
    }

    fn wait(
        slot: &(Mutex<Option<u32>>, Condvar),
        deadline: Option<Instant>,
        interrupt: &Interrupt,
    ) -> Wait<u32> {
        wait_until(&slot.0, &slot.1, deadline, interrupt, |value| *value)
    }

    #[test]
    fn ready_without_blocking() {
        let slot = slot();
        *lock(&slot.0) = Some(1);
        assert_eq!(wait(&slot, Some(Instant::now()), &Interrupt::default()), Wait::Ready(1));
    }

    #[test]
    fn wait_times_out() {
        let slot = slot();
        let start = Instant::now();
        let deadline = start + Duration::from_millis(50);
        assert_eq!(wait(&slot, Some(deadline), &Interrupt::default()), Wait::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_observes_interrupt() {
        let slot = slot();
        let interrupt = Interrupt::default();
        let waiter = thread::spawn({
            let slot = slot.clone();
            let interrupt = interrupt.clone();
            move || wait(&slot, None, &interrupt)
        });
        thread::sleep(Duration::from_millis(30));
        interrupt.interrupt();
        assert_eq!(waiter.join().unwrap(), Wait::Interrupted);
    }

    #[test]
    fn wait_wakes_on_notify() {
        let slot = slot();
        let waiter = thread::spawn({
            let slot = slot.clone();
            move || wait(&slot, None, &Interrupt::default())
        });
        thread::sleep(Duration::from_millis(10));
        *lock(&slot.0) = Some(7);
        slot.1.notify_all();
        assert_eq!(waiter.join().unwrap(), Wait::Ready(7));
    }
}
