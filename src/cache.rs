//! Replicated key/value cache and the transactional wrapper every mutation of
//! shared state goes through.
//!
//! [`MemoryCache`] stands in for the cluster-replicated map: members of one
//! cluster share it by `Arc`. It uses optimistic concurrency, each key carries
//! a version and commit fails with [`CacheError::Conflict`] when a key read or
//! written by the transaction changed in between.
//!
//! [`TransactionalCache::execute`] runs a procedure inside a transaction and
//! retries the whole transaction after a short fixed backoff whenever the
//! procedure or the commit reports a retryable error. That retry loop has no
//! bound; callers that cannot afford it must impose their own deadline.
//!
//! A removed key leaves a tombstone carrying the removal version, so a
//! transaction that saw the key absent still conflicts with a put and remove
//! that happened behind its back. Tombstones older than the oldest open
//! transaction can no longer be told apart from a key that never existed and
//! are pruned on commit.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error, trace};

use crate::{
    error::{CacheError, Error, Result},
    wait::lock,
};

pub const RETRY_DELAY: Duration = Duration::from_millis(10);

pub struct MemoryCache<K, V> {
    storage: Mutex<Storage<K, V>>,
}

struct Storage<K, V> {
    // ordered for deterministic scans
    entries: BTreeMap<K, (u64, V)>,
    // version of removed keys, so a remove is visible to concurrent readers
    tombstones: HashMap<K, u64>,
    version: u64,
    // begin version of open transactions, with their count
    active: BTreeMap<u64, usize>,
}

impl<K: Ord + Hash + Clone, V: Clone> Default for MemoryCache<K, V> {
    fn default() -> Self {
        Self {
            storage: Mutex::new(Storage {
                entries: BTreeMap::new(),
                tombstones: HashMap::new(),
                version: 0,
                active: BTreeMap::new(),
            }),
        }
    }
}

impl<K: Ord + Hash + Clone, V: Clone> Storage<K, V> {
    /// Version of `key` as seen by a transaction that began at `begin`. A
    /// removal older than `begin` looks the same as a key that never existed.
    fn version_of(&self, key: &K, begin: u64) -> u64 {
        self.entries
            .get(key)
            .map(|(version, _)| *version)
            .or_else(|| self.tombstones.get(key).copied().filter(|v| *v > begin))
            .unwrap_or(0)
    }

    fn open(&mut self) -> u64 {
        *self.active.entry(self.version).or_default() += 1;
        self.version
    }

    fn close(&mut self, begin: u64) {
        if let Some(count) = self.active.get_mut(&begin) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(&begin);
            }
        }
    }

    fn prune(&mut self) {
        let watermark = self
            .active
            .keys()
            .next()
            .copied()
            .unwrap_or(self.version);
        let before = self.tombstones.len();
        self.tombstones.retain(|_, version| *version > watermark);
        let pruned = before - self.tombstones.len();
        if pruned > 0 {
            trace!("pruned {} tombstones up to version {}", pruned, watermark);
        }
    }
}

impl<K: Ord + Hash + Clone, V: Clone> MemoryCache<K, V> {
    pub fn begin(&self, timeout: Duration) -> Transaction<'_, K, V> {
        let begin = lock(&self.storage).open();
        Transaction {
            cache: self,
            begin,
            deadline: Instant::now() + timeout,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            state: TxState::Active,
        }
    }

    /// Read outside of any transaction.
    pub fn get(&self, key: &K) -> Option<V> {
        lock(&self.storage)
            .entries
            .get(key)
            .map(|(_, value)| value.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.storage).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values(&self) -> Vec<V> {
        lock(&self.storage)
            .entries
            .values()
            .map(|(_, value)| value.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

/// Handle of one open transaction. Dropping a transaction that is neither
/// committed nor rolled back rolls it back.
pub struct Transaction<'a, K: Ord + Hash + Clone, V: Clone> {
    cache: &'a MemoryCache<K, V>,
    begin: u64,
    deadline: Instant,
    reads: HashMap<K, u64>,
    // None stages a removal
    writes: BTreeMap<K, Option<V>>,
    state: TxState,
}

impl<'a, K: Ord + Hash + Clone, V: Clone> Transaction<'a, K, V> {
    pub fn get(&mut self, key: &K) -> Option<V> {
        if let Some(write) = self.writes.get(key) {
            return write.clone();
        }
        let cache = self.cache;
        let storage = lock(&cache.storage);
        let begin = self.begin;
        self.reads
            .entry(key.clone())
            .or_insert_with(|| storage.version_of(key, begin));
        storage.entries.get(key).map(|(_, value)| value.clone())
    }

    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.get(&key);
        self.writes.insert(key, Some(value));
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.get(key);
        if previous.is_some() {
            self.writes.insert(key.clone(), None);
        }
        previous
    }

    /// Every entry visible to this transaction. All of them become part of
    /// the read set.
    pub fn entries(&mut self) -> Vec<(K, V)> {
        let cache = self.cache;
        let mut visible: BTreeMap<K, V> = {
            let storage = lock(&cache.storage);
            for (key, (version, _)) in &storage.entries {
                self.reads.entry(key.clone()).or_insert(*version);
            }
            storage
                .entries
                .iter()
                .map(|(key, (_, value))| (key.clone(), value.clone()))
                .collect()
        };
        for (key, write) in &self.writes {
            match write {
                Some(value) => visible.insert(key.clone(), value.clone()),
                None => visible.remove(key),
            };
        }
        visible.into_iter().collect()
    }

    pub fn commit(&mut self) -> Result<(), CacheError> {
        if self.state != TxState::Active {
            return Err(CacheError::Failed("transaction already finished".to_string()));
        }
        if Instant::now() > self.deadline {
            self.rollback();
            return Err(CacheError::TimedOut);
        }

        let cache = self.cache;
        let mut storage = lock(&cache.storage);
        let conflict = self
            .reads
            .iter()
            .any(|(key, version)| storage.version_of(key, self.begin) != *version);
        if conflict {
            drop(storage);
            self.rollback();
            return Err(CacheError::Conflict);
        }
        for (key, write) in std::mem::take(&mut self.writes) {
            storage.version += 1;
            let version = storage.version;
            match write {
                Some(value) => {
                    storage.tombstones.remove(&key);
                    storage.entries.insert(key, (version, value));
                }
                None => {
                    storage.entries.remove(&key);
                    storage.tombstones.insert(key, version);
                }
            }
        }
        storage.close(self.begin);
        storage.prune();
        self.state = TxState::Committed;
        Ok(())
    }

    pub fn rollback(&mut self) {
        if self.state == TxState::Active {
            self.writes.clear();
            self.reads.clear();
            lock(&self.cache.storage).close(self.begin);
            self.state = TxState::RolledBack;
        }
    }
}

impl<'a, K: Ord + Hash + Clone, V: Clone> Drop for Transaction<'a, K, V> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            trace!("roll back unfinished transaction");
            self.rollback();
        }
    }
}

/// Result of a cache procedure: commit the transaction or abandon it, either
/// way handing back a value to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    Commit(T),
    Abort(T),
}

pub struct TransactionalCache<K, V> {
    cache: Arc<MemoryCache<K, V>>,
    timeout: Duration,
    retry_delay: Duration,
}

impl<K: Ord + Hash + Clone, V: Clone> TransactionalCache<K, V> {
    pub fn new(cache: Arc<MemoryCache<K, V>>, timeout: Duration) -> Self {
        Self {
            cache,
            timeout,
            retry_delay: RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn cache(&self) -> &Arc<MemoryCache<K, V>> {
        &self.cache
    }

    pub fn execute<T>(
        &self,
        mut procedure: impl FnMut(&mut Transaction<'_, K, V>) -> Result<Step<T>, CacheError>,
    ) -> Result<T> {
        let mut retry = 0usize;
        loop {
            let mut transaction = self.cache.begin(self.timeout);
            let err = match procedure(&mut transaction) {
                Ok(Step::Commit(value)) => match transaction.commit() {
                    Ok(()) => return Ok(value),
                    Err(err) => err,
                },
                Ok(Step::Abort(value)) => {
                    transaction.rollback();
                    return Ok(value);
                }
                Err(err) => err,
            };
            // transaction dropped here, rolled back unless committed
            drop(transaction);

            if !err.is_retryable() {
                error!("cache transaction failed: {}", err);
                return Err(Error::Cache(err));
            }
            retry += 1;
            debug!("cache transaction retry {}: {}", retry, err);
            thread::sleep(self.retry_delay);
        }
    }
}
