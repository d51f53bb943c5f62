//! Entry store
//!
//! The keyed map behind every registry and sandbox. Reads take the shared
//! side of a readers-writer lock; mutations take the exclusive side only for
//! the duration of the single map operation. Transaction-level exclusion is
//! the job of [`crate::lock::LockCoordinator`].

use std::ops::Deref;

use parking_lot::{RwLock, RwLockReadGuard};

use crate::entry::{neighbor_keys, Entry, EntryMap};
use crate::error::{RegistryError, Result};

/// Keyed entry map guarded by a readers-writer lock
pub struct EntryStore<E: Entry> {
    /// Owner name used in error messages
    name: String,
    entries: RwLock<EntryMap<E>>,
}

impl<E: Entry> EntryStore<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(EntryMap::<E>::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains_key(&self, key: &E::Key) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Copy of a single entry
    pub fn get(&self, key: &E::Key) -> Option<E> {
        self.entries.read().get(key).cloned()
    }

    /// Copy of a single entry, or `NotAvailable` with the nearest keys as hint
    pub fn require(&self, key: &E::Key) -> Result<E> {
        let entries = self.entries.read();
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| not_available::<E>(&self.name, key, &entries))
    }

    /// Deep copy of the whole map
    pub fn snapshot(&self) -> EntryMap<E> {
        self.entries.read().clone()
    }

    /// Copies of all entries, in no particular order
    pub fn entries(&self) -> Vec<E> {
        self.entries.read().values().cloned().collect()
    }

    /// Read-only view of the live map
    ///
    /// Writers block while the view is alive, so keep it short.
    pub fn view(&self) -> EntryMapView<'_, E> {
        EntryMapView {
            guard: self.entries.read(),
        }
    }

    /// Insert an entry whose key is not present yet
    pub fn insert_new(&self, entry: E) -> Result<()> {
        let key = entry.key();
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(RegistryError::AlreadyExists {
                registry: self.name.clone(),
                key: key.to_string(),
            });
        }
        entries.insert(key, entry);
        Ok(())
    }

    /// Replace an existing entry, returning the previous value
    pub fn replace_existing(&self, entry: E) -> Result<E> {
        let key = entry.key();
        let mut entries = self.entries.write();
        if let Some(slot) = entries.get_mut(&key) {
            return Ok(std::mem::replace(slot, entry));
        }
        Err(not_available::<E>(&self.name, &key, &entries))
    }

    /// Remove an entry by key
    pub fn remove(&self, key: &E::Key) -> Result<E> {
        let mut entries = self.entries.write();
        match entries.remove(key) {
            Some(entry) => Ok(entry),
            None => Err(not_available::<E>(&self.name, key, &entries)),
        }
    }

    /// Swap the whole content for `entries`
    pub fn replace_all(&self, entries: EntryMap<E>) {
        *self.entries.write() = entries;
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Keys whose entries differ between this store and `other`
    pub fn diverging_keys(&self, other: &EntryStore<E>) -> Vec<E::Key> {
        let ours = self.entries.read();
        let theirs = other.entries.read();

        let mut keys: Vec<E::Key> = ours
            .iter()
            .filter(|(key, entry)| theirs.get(*key) != Some(*entry))
            .map(|(key, _)| key.clone())
            .chain(
                theirs
                    .keys()
                    .filter(|key| !ours.contains_key(*key))
                    .cloned(),
            )
            .collect();
        keys.sort();
        keys
    }
}

fn not_available<E: Entry>(registry: &str, key: &E::Key, entries: &EntryMap<E>) -> RegistryError {
    RegistryError::NotAvailable {
        registry: registry.to_string(),
        key: key.to_string(),
        neighbors: neighbor_keys(key, entries.keys())
            .iter()
            .map(ToString::to_string)
            .collect(),
    }
}

/// Read-only view of a store's map, see [`EntryStore::view`]
pub struct EntryMapView<'a, E: Entry> {
    guard: RwLockReadGuard<'a, EntryMap<E>>,
}

impl<E: Entry> Deref for EntryMapView<'_, E> {
    type Target = EntryMap<E>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}
