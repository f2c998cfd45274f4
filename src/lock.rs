//! Manager-level read/write lock and the stack that releases held locks in
//! reverse acquisition order.
//!
//! [`ManagerLock`] behind an `Arc` hands out owned guards through
//! `read_arc`/`write_arc`, so several of them can be pushed on one
//! [`LockStack`] within a single call chain. The stack releases them last
//! in, first out, on [`LockStack::clear`] and on drop, which covers unwinding.

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use tracing::trace;

/// Something held that must be given back exactly once, on the thread that
/// took it.
pub trait Release {
    fn release(self: Box<Self>);
}

#[derive(Default)]
pub struct LockStack {
    held: Vec<Box<dyn Release>>,
}

impl LockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, held: impl Release + 'static) {
        self.held.push(Box::new(held));
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release everything, most recent first. Clearing an empty stack does
    /// nothing.
    pub fn clear(&mut self) {
        while let Some(held) = self.held.pop() {
            held.release();
        }
    }
}

impl Drop for LockStack {
    fn drop(&mut self) {
        if !self.held.is_empty() {
            trace!("release {} locks on drop", self.held.len());
        }
        self.clear();
    }
}

/// Container-wide lock: mapping changes write, flow installs read.
pub type ManagerLock = RwLock<()>;

impl<T: 'static> Release for ArcRwLockReadGuard<RawRwLock, T> {
    fn release(self: Box<Self>) {}
}

impl<T: 'static> Release for ArcRwLockWriteGuard<RawRwLock, T> {
    fn release(self: Box<Self>) {}
}
