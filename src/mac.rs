//! MAC learning tables, one per virtual bridge.
//!
//! Tables are only reachable through [`MacTables::lock`], so every mutation
//! happens with the table mutex held; the tables themselves take `&mut self`
//! and carry no locking of their own.

use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet, HashMap},
    fmt,
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard},
};

use tracing::trace;

use crate::{
    common::{MacVlan, SwitchPort},
    wait::lock,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BridgePath {
    pub tenant: String,
    pub bridge: String,
}

impl BridgePath {
    pub fn new(tenant: impl Into<String>, bridge: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            bridge: bridge.into(),
        }
    }
}

impl fmt::Display for BridgePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.bridge)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacTableEntry {
    pub host: MacVlan,
    pub port: SwitchPort,
    pub inet: BTreeSet<Ipv4Addr>,
}

#[derive(Debug, Default)]
pub struct MacAddressTable {
    entries: HashMap<MacVlan, MacTableEntry>,
}

impl MacAddressTable {
    /// Learn `host` behind `port`. A host seen on another port moves and
    /// forgets its addresses. Returns whether the table changed.
    pub fn learn(&mut self, host: MacVlan, port: SwitchPort, inet: Option<Ipv4Addr>) -> bool {
        let entry = match self.entries.entry(host) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(MacTableEntry {
                    host,
                    port,
                    inet: inet.into_iter().collect(),
                });
                return true;
            }
        };
        let mut changed = false;
        if entry.port != port {
            entry.port = port;
            entry.inet.clear();
            changed = true;
        }
        if let Some(inet) = inet {
            changed |= entry.inet.insert(inet);
        }
        changed
    }

    pub fn get(&self, host: &MacVlan) -> Option<&MacTableEntry> {
        self.entries.get(host)
    }

    pub fn remove(&mut self, host: &MacVlan) -> Option<MacTableEntry> {
        self.entries.remove(host)
    }

    /// Remove every entry `filter` accepts.
    pub fn flush(&mut self, filter: impl Fn(&MacTableEntry) -> bool) -> Vec<MacTableEntry> {
        let hosts: Vec<_> = self
            .entries
            .values()
            .filter(|entry| filter(entry))
            .map(|entry| entry.host)
            .collect();
        hosts
            .iter()
            .filter_map(|host| self.entries.remove(host))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MacTableEntry> {
        self.entries.values()
    }
}

pub type TableMap = BTreeMap<BridgePath, MacAddressTable>;

#[derive(Default)]
pub struct MacTables {
    tables: Mutex<TableMap>,
}

impl MacTables {
    pub fn lock(&self) -> MutexGuard<'_, TableMap> {
        lock(&self.tables)
    }

    /// Flush matching entries from every bridge of `tenant`, or of every
    /// tenant. Returns the removed entries per bridge.
    pub fn flush(
        &self,
        tenant: Option<&str>,
        filter: impl Fn(&MacTableEntry) -> bool,
    ) -> Vec<(BridgePath, MacTableEntry)> {
        let mut tables = self.lock();
        let mut removed = Vec::new();
        for (path, table) in tables.iter_mut() {
            if tenant.map(|tenant| path.tenant != tenant).unwrap_or(false) {
                continue;
            }
            for entry in table.flush(&filter) {
                trace!("{}: flush {}@{} on {}", path, entry.host.mac, entry.host.vlan, entry.port);
                removed.push((path.clone(), entry));
            }
        }
        removed
    }
}
