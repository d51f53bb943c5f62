//! Plugin hook points and observers
//!
//! Plugins (audit trail, persistence, migration) are external collaborators.
//! The registry calls them at fixed points of every operation; `before_*`
//! hooks and the access gate can veto, the rest only observe.
//! Observers are notified after a transaction is released, best effort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::consistency::ModificationHooks;
use crate::entry::Entry;
use crate::error::Result;

/// Registry plugin
///
/// Every method has a no-op default so plugins implement only what they need.
#[allow(unused_variables)]
pub trait RegistryPlugin<E: Entry>: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Access gate consulted by every write-access precheck
    fn check_access(&self) -> Result<()> {
        Ok(())
    }

    fn before_register(&self, entry: &E) -> Result<()> {
        Ok(())
    }
    fn after_register(&self, entry: &E) {}

    fn before_update(&self, entry: &E) -> Result<()> {
        Ok(())
    }
    fn after_update(&self, entry: &E) {}

    fn before_remove(&self, entry: &E) -> Result<()> {
        Ok(())
    }
    fn after_remove(&self, entry: &E) {}

    fn before_get(&self, key: &E::Key) {}
    fn after_get(&self, entry: &E) {}

    fn before_clear(&self) -> Result<()> {
        Ok(())
    }
    fn after_clear(&self) {}

    fn before_consistency_check(&self) {}
    /// Runs after every converged check; persistence plugins save here
    fn after_consistency_check(&self) -> Result<()> {
        Ok(())
    }

    fn before_consistency_modification(&self, entry: &E) {}
    fn after_consistency_modification(&self, entry: &E) {}

    fn before_upstream_dependency_notification(&self, upstream: &str) {}
    /// Runs once the revalidation triggered by `upstream` is done
    fn after_upstream_dependency_notification(&self, upstream: &str) {}

    /// Runs before a mutation is staged
    fn before_registry_change(&self) {}
    /// Runs after a committed transaction changed the registry
    fn after_registry_change(&self) {}

    /// Runs once during shutdown
    fn shutdown(&self) {}
}

/// Ordered plugin list of a registry
pub struct PluginSet<E: Entry> {
    plugins: RwLock<Vec<Arc<dyn RegistryPlugin<E>>>>,
}

impl<E: Entry> Default for PluginSet<E> {
    fn default() -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
        }
    }
}

impl<E: Entry> PluginSet<E> {
    pub fn add(&self, plugin: Arc<dyn RegistryPlugin<E>>) {
        self.plugins.write().push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Call `shutdown` on every plugin and drop them
    pub fn shutdown(&self) {
        let plugins = std::mem::take(&mut *self.plugins.write());
        for plugin in plugins {
            plugin.shutdown();
        }
    }

    // Plugins may call back into the registry, so hooks run on a copy of the
    // list and never under the list lock.
    fn current(&self) -> Vec<Arc<dyn RegistryPlugin<E>>> {
        self.plugins.read().clone()
    }

    fn veto(&self, hook: impl Fn(&dyn RegistryPlugin<E>) -> Result<()>) -> Result<()> {
        self.current().iter().try_for_each(|plugin| hook(plugin.as_ref()))
    }

    fn each(&self, hook: impl Fn(&dyn RegistryPlugin<E>)) {
        for plugin in self.current() {
            hook(plugin.as_ref());
        }
    }

    pub fn check_access(&self) -> Result<()> {
        self.veto(|p| p.check_access())
    }

    pub fn before_register(&self, entry: &E) -> Result<()> {
        self.veto(|p| p.before_register(entry))
    }

    pub fn after_register(&self, entry: &E) {
        self.each(|p| p.after_register(entry))
    }

    pub fn before_update(&self, entry: &E) -> Result<()> {
        self.veto(|p| p.before_update(entry))
    }

    pub fn after_update(&self, entry: &E) {
        self.each(|p| p.after_update(entry))
    }

    pub fn before_remove(&self, entry: &E) -> Result<()> {
        self.veto(|p| p.before_remove(entry))
    }

    pub fn after_remove(&self, entry: &E) {
        self.each(|p| p.after_remove(entry))
    }

    pub fn before_get(&self, key: &E::Key) {
        self.each(|p| p.before_get(key))
    }

    pub fn after_get(&self, entry: &E) {
        self.each(|p| p.after_get(entry))
    }

    pub fn before_clear(&self) -> Result<()> {
        self.veto(|p| p.before_clear())
    }

    pub fn after_clear(&self) {
        self.each(|p| p.after_clear())
    }

    pub fn before_consistency_check(&self) {
        self.each(|p| p.before_consistency_check())
    }

    pub fn after_consistency_check(&self) -> Result<()> {
        self.veto(|p| p.after_consistency_check())
    }

    pub fn before_upstream_dependency_notification(&self, upstream: &str) {
        self.each(|p| p.before_upstream_dependency_notification(upstream))
    }

    pub fn after_upstream_dependency_notification(&self, upstream: &str) {
        self.each(|p| p.after_upstream_dependency_notification(upstream))
    }

    pub fn before_registry_change(&self) {
        self.each(|p| p.before_registry_change())
    }

    pub fn after_registry_change(&self) {
        self.each(|p| p.after_registry_change())
    }
}

impl<E: Entry> ModificationHooks<E> for PluginSet<E> {
    fn before_modification(&self, entry: &E) {
        self.each(|p| p.before_consistency_modification(entry))
    }

    fn after_modification(&self, entry: &E) {
        self.each(|p| p.after_consistency_modification(entry))
    }
}

// =============================================================================
// Observers
// =============================================================================

/// Change published to observers after a committed transaction
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent<E> {
    Registered(E),
    Updated(E),
    Removed(E),
    Replaced(Vec<E>),
    Cleared,
    /// A dependency change re-ran the consistency check and entries changed
    Revalidated,
}

/// Handle returned by `add_observer`
pub type ObserverId = u64;

/// Observer callback
pub type Observer<E> = Arc<dyn Fn(&RegistryEvent<E>) -> Result<()> + Send + Sync>;

/// Registered observers of one registry
pub struct ObserverSet<E> {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Observer<E>)>>,
}

impl<E> Default for ObserverSet<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: RwLock::new(Vec::new()),
        }
    }
}

impl<E> ObserverSet<E> {
    pub fn add(&self, observer: Observer<E>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.write().push((id, observer));
        id
    }

    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(observer, _)| *observer != id);
        observers.len() != before
    }

    pub fn clear(&self) {
        self.observers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Deliver `event` to every observer; failures are logged, never returned
    pub fn notify(&self, registry: &str, event: &RegistryEvent<E>) {
        let observers: Vec<Observer<E>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();

        for observer in observers {
            if let Err(err) = observer(event) {
                warn!(registry, error = %err, "registry observer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RegistryError;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Note(u8);

    impl Entry for Note {
        type Key = u8;

        fn key(&self) -> u8 {
            self.0
        }
    }

    #[derive(Default)]
    struct Audit {
        log: Mutex<Vec<String>>,
    }

    impl RegistryPlugin<Note> for Audit {
        fn before_register(&self, entry: &Note) -> Result<()> {
            if entry.0 == 0 {
                return Err(RegistryError::rejected("notes", "zero is reserved"));
            }
            self.log.lock().push(format!("before {}", entry.0));
            Ok(())
        }

        fn after_register(&self, entry: &Note) {
            self.log.lock().push(format!("after {}", entry.0));
        }
    }

    #[test]
    fn test_veto_and_observe() {
        let plugins = PluginSet::default();
        let audit = Arc::new(Audit::default());
        plugins.add(audit.clone());

        assert!(plugins.before_register(&Note(0)).is_err());
        plugins.before_register(&Note(4)).unwrap();
        plugins.after_register(&Note(4));
        assert_eq!(*audit.log.lock(), vec!["before 4", "after 4"]);
    }

    #[test]
    fn test_observer_failures_are_contained() {
        let observers: ObserverSet<Note> = ObserverSet::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        observers.add(Arc::new(|_: &RegistryEvent<Note>| -> Result<()> {
            Err(RegistryError::InvalidState("observer down".to_string()))
        }));
        let sink = seen.clone();
        let id = observers.add(Arc::new(move |event: &RegistryEvent<Note>| -> Result<()> {
            sink.lock().push(event.clone());
            Ok(())
        }));

        observers.notify("notes", &RegistryEvent::Registered(Note(1)));
        assert_eq!(*seen.lock(), vec![RegistryEvent::Registered(Note(1))]);

        assert!(observers.remove(id));
        assert!(!observers.remove(id));
        assert_eq!(observers.len(), 1);
    }
}
