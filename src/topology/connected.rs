//! The connected subset of a proxy's instances, ordered by ping time.
use common::ServerSelector;
use topology::instance::ServerInstance;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct Entry {
    instance: Arc<ServerInstance>,
    // The average ping time the entry was last sorted by.
    ping_time: Duration,
}

/// Connected instances sorted ascending by average ping time. Every
/// operation takes the same lock; the list is re-sorted lazily whenever a
/// member's ping time has changed since it was last sorted.
#[derive(Default)]
pub struct ConnectedInstanceCollection {
    entries: Mutex<Vec<Entry>>,
}

impl ConnectedInstanceCollection {
    pub fn new() -> ConnectedInstanceCollection {
        ConnectedInstanceCollection { entries: Mutex::new(Vec::new()) }
    }

    // Returns the entries re-sorted by current ping time.
    fn sorted(&self) -> MutexGuard<Vec<Entry>> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut changed = false;
        for entry in entries.iter_mut() {
            let current = entry.instance.average_ping_time();
            if current != entry.ping_time {
                entry.ping_time = current;
                changed = true;
            }
        }

        if changed {
            // Stable, so equal ping times keep their insertion order.
            entries.sort_by_key(|entry| entry.ping_time);
        }

        entries
    }

    /// Inserts the instance after every entry whose ping time is less than
    /// or equal to its own. Does nothing if it is already present.
    pub fn add(&self, instance: &Arc<ServerInstance>) {
        let mut entries = self.sorted();
        if entries.iter().any(|entry| Arc::ptr_eq(&entry.instance, instance)) {
            return;
        }

        let ping_time = instance.average_ping_time();
        let index = entries.iter()
            .position(|entry| entry.ping_time > ping_time)
            .unwrap_or(entries.len());

        entries.insert(index, Entry {
            instance: instance.clone(),
            ping_time: ping_time,
        });
    }

    /// Removes the instance. Returns true if it was present.
    pub fn remove(&self, instance: &Arc<ServerInstance>) -> bool {
        let mut entries = self.sorted();
        let before = entries.len();
        entries.retain(|entry| !Arc::ptr_eq(&entry.instance, instance));
        entries.len() != before
    }

    pub fn contains(&self, instance: &Arc<ServerInstance>) -> bool {
        self.sorted().iter().any(|entry| Arc::ptr_eq(&entry.instance, instance))
    }

    pub fn clear(&self) {
        self.sorted().clear();
    }

    pub fn len(&self) -> usize {
        self.sorted().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the instances, fastest first.
    pub fn instances(&self) -> Vec<Arc<ServerInstance>> {
        self.sorted().iter().map(|entry| entry.instance.clone()).collect()
    }

    /// Asks the selector to choose among the sorted instances. Returns `None`
    /// when the collection is empty.
    pub fn choose_server_instance(&self, selector: &dyn ServerSelector) -> Option<Arc<ServerInstance>> {
        let instances = self.instances();
        if instances.is_empty() {
            return None;
        }
        selector.choose(&instances)
    }
}
