//! Per-service instance table read by routers.
//!
//! Writers publish whole address lists; readers take a snapshot without
//! locking. A reader never sees a half-applied update.

use crate::descriptor::AddressEntry;
use crate::error::DiscoveryError;
use crate::resolver::AddressSink;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type Snapshot = HashMap<String, Arc<Vec<AddressEntry>>>;

#[derive(Debug)]
pub struct InstanceTable {
    services: ArcSwap<Snapshot>,
}

impl Default for InstanceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceTable {
    pub fn new() -> Self {
        Self {
            services: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Builds a table from `(server_type, instance_id)` pairs, all weight 1.
    pub fn from_static<I, S, A>(instances: I) -> Self
    where
        I: IntoIterator<Item = (S, A)>,
        S: Into<String>,
        A: Into<String>,
    {
        let mut grouped: HashMap<String, Vec<AddressEntry>> = HashMap::new();
        for (server_type, addr) in instances {
            let entries = grouped.entry(server_type.into()).or_default();
            let entry = AddressEntry::new(addr, 1);
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        let snapshot = grouped
            .into_iter()
            .map(|(server_type, entries)| (server_type, Arc::new(entries)))
            .collect();
        Self {
            services: ArcSwap::from_pointee(snapshot),
        }
    }

    /// Current instances of `server_type`; `None` when there are none.
    pub fn instances(&self, server_type: &str) -> Option<Arc<Vec<AddressEntry>>> {
        self.services
            .load()
            .get(server_type)
            .filter(|entries| !entries.is_empty())
            .cloned()
    }

    /// Replaces the instance list of one server type.
    pub fn replace(&self, server_type: &str, entries: Vec<AddressEntry>) {
        let entries = Arc::new(entries);
        self.services.rcu(|current| {
            let mut next = Snapshot::clone(current);
            next.insert(server_type.to_string(), Arc::clone(&entries));
            next
        });
        debug!("Instance table updated for {}", server_type);
    }

    pub fn server_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.services.load().keys().cloned().collect();
        types.sort();
        types
    }
}

impl AddressSink for InstanceTable {
    fn update(&self, name: &str, addresses: &[AddressEntry]) -> Result<(), DiscoveryError> {
        self.replace(name, addresses.to_vec());
        Ok(())
    }
}
