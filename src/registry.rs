//! Registry
//!
//! The CRUD facade composing store, sandbox, consistency engine, lock
//! coordinator and dependency graph under one transaction envelope.
//!
//! Every mutation follows the same path:
//!
//! ```text
//! lock() ──► write-access precheck ──► before_* hook
//!        ──► sandbox apply + verify ──► live apply
//!        ──► consistency check (rollback unless forced) ──► sandbox resync
//!        ──► after_* hooks ──► unlock()
//!        ──► notify dependents, then observers (best effort)
//! ```

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::ReentrantMutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::consistency::{CheckContext, ConsistencyEngine, ConsistencyHandler, HandlerList};
use crate::dependency::{
    dependency_topology, Dependent, DependencyGraph, DependencyTopology, DependentSet, ListenerId,
    Upstream,
};
use crate::entry::{Entry, EntryMap};
use crate::error::{MultiError, RegistryError, Result};
use crate::hooks::{Observer, ObserverId, ObserverSet, PluginSet, RegistryEvent, RegistryPlugin};
use crate::lock::{next_registry_id, LockCoordinator, RegistryId, WriteLock};
use crate::sandbox::{Sandbox, SandboxMode};
use crate::store::{EntryMapView, EntryStore};

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Registry`]
pub struct RegistryBuilder<E: Entry> {
    name: String,
    config: EngineConfig,
    handlers: Vec<Arc<dyn ConsistencyHandler<E>>>,
    plugins: Vec<Arc<dyn RegistryPlugin<E>>>,
    sandbox: Option<SandboxMode>,
    foreign: bool,
}

impl<E: Entry> RegistryBuilder<E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: EngineConfig::default(),
            handlers: Vec::new(),
            plugins: Vec::new(),
            sandbox: None,
            foreign: false,
        }
    }

    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Append a consistency handler; handlers run in registration order
    pub fn handler(mut self, handler: impl ConsistencyHandler<E> + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn RegistryPlugin<E>>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Override the sandbox mode taken from the configuration
    pub fn sandbox(mut self, mode: SandboxMode) -> Self {
        self.sandbox = Some(mode);
        self
    }

    /// Mock sandbox, for mirrors of an externally synchronized source
    pub fn without_sandbox(self) -> Self {
        self.sandbox(SandboxMode::Mock)
    }

    /// Owned by a remote party: external `lock()` calls are rejected
    pub fn foreign(mut self) -> Self {
        self.foreign = true;
        self
    }

    pub fn build(self) -> Arc<Registry<E>> {
        let id = next_registry_id();
        let engine = self.config.engine();
        let handlers: HandlerList<E> = Arc::new(parking_lot::RwLock::new(self.handlers));
        let mode = self.sandbox.unwrap_or_else(|| self.config.sandbox_mode());
        let plugins = PluginSet::default();
        for plugin in self.plugins {
            plugins.add(plugin);
        }

        Arc::new_cyclic(|self_ref| Registry {
            id,
            self_ref: self_ref.clone(),
            store: EntryStore::new(self.name.clone()),
            sandbox: Sandbox::new(mode, &self.name, handlers.clone(), engine),
            handlers,
            engine,
            plugins,
            observers: ObserverSet::default(),
            dependencies: DependencyGraph::new(self.name.clone(), id),
            dependents: DependentSet::default(),
            lock: LockCoordinator::new(id, self.name.clone(), self.config.jitter()),
            check_guard: ReentrantMutex::new(Cell::new(false)),
            consistent: AtomicBool::new(true),
            force_mode: AtomicBool::new(self.config.consistency.force_mode),
            shut_down: AtomicBool::new(false),
            foreign: self.foreign,
            name: self.name,
        })
    }
}

// =============================================================================
// Transaction guard
// =============================================================================

/// Holds the transitive write lock of a registry until dropped
#[must_use = "the transaction ends when the guard is dropped"]
pub struct TransactionGuard<'a, E: Entry> {
    registry: &'a Registry<E>,
}

impl<E: Entry> TransactionGuard<'_, E> {
    /// Nesting depth of the transaction this guard belongs to
    pub fn depth(&self) -> usize {
        self.registry.lock.depth()
    }

    /// Registries locked by the outermost transaction, this one included
    pub fn locked_registries(&self) -> usize {
        self.registry.lock.held_count()
    }
}

impl<E: Entry> Drop for TransactionGuard<'_, E> {
    fn drop(&mut self) {
        self.registry.lock.unlock();
    }
}

/// Marks a consistency run on the current thread, cleared on drop
struct RunningCheck<'a>(&'a Cell<bool>);

impl Drop for RunningCheck<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Pre-transaction state restored when a live commit fails its check
struct Backup<E: Entry> {
    entries: EntryMap<E>,
    consistent: bool,
}

// =============================================================================
// Registry
// =============================================================================

/// Consistent, dependency-aware registry of entries
///
/// Built through [`Registry::builder`] as an `Arc` so dependents can hold
/// weak references to it.
pub struct Registry<E: Entry> {
    id: RegistryId,
    name: String,
    self_ref: Weak<Registry<E>>,
    store: EntryStore<E>,
    sandbox: Sandbox<E>,
    handlers: HandlerList<E>,
    engine: ConsistencyEngine,
    plugins: PluginSet<E>,
    observers: ObserverSet<E>,
    dependencies: DependencyGraph,
    dependents: DependentSet,
    lock: LockCoordinator,
    check_guard: ReentrantMutex<Cell<bool>>,
    consistent: AtomicBool,
    force_mode: AtomicBool,
    shut_down: AtomicBool,
    foreign: bool,
}

impl<E: Entry> Registry<E> {
    pub fn builder(name: impl Into<String>) -> RegistryBuilder<E> {
        RegistryBuilder::new(name)
    }

    /// Registry with default configuration and no handlers
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        RegistryBuilder::new(name).build()
    }

    pub fn id(&self) -> RegistryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ===== Mutations =====

    /// Add a new entry
    ///
    /// Returns the entry as stored, including any repair made by handlers.
    pub fn register(&self, entry: E) -> Result<E> {
        let key = entry.key();
        let tx = self.transaction()?;
        self.check_write_access()?;
        if self.store.contains_key(&key) {
            return Err(RegistryError::AlreadyExists {
                registry: self.name.clone(),
                key: key.to_string(),
            });
        }
        self.plugins.before_register(&entry)?;

        self.apply(
            |sandbox| sandbox.register(entry.clone()),
            |store| store.insert_new(entry.clone()),
        )?;

        let stored = self.store.require(&key)?;
        self.plugins.after_register(&stored);
        self.plugins.after_registry_change();
        drop(tx);

        self.publish(RegistryEvent::Registered(stored.clone()));
        Ok(stored)
    }

    /// Replace the entry with the same key
    pub fn update(&self, entry: E) -> Result<E> {
        let key = entry.key();
        let tx = self.transaction()?;
        self.check_write_access()?;
        self.store.require(&key)?;
        self.plugins.before_update(&entry)?;

        self.apply(
            |sandbox| sandbox.update(entry.clone()),
            |store| store.replace_existing(entry.clone()).map(|_| ()),
        )?;

        let stored = self.store.require(&key)?;
        self.plugins.after_update(&stored);
        self.plugins.after_registry_change();
        drop(tx);

        self.publish(RegistryEvent::Updated(stored.clone()));
        Ok(stored)
    }

    /// Remove the entry stored under `key` and return it
    pub fn remove(&self, key: &E::Key) -> Result<E> {
        let tx = self.transaction()?;
        self.check_write_access()?;
        let existing = self.store.require(key)?;
        self.plugins.before_remove(&existing)?;

        let removed = self.apply(|sandbox| sandbox.remove(key), |store| store.remove(key))?;

        self.plugins.after_remove(&removed);
        self.plugins.after_registry_change();
        drop(tx);

        self.publish(RegistryEvent::Removed(removed.clone()));
        Ok(removed)
    }

    /// Remove the entry with the same key as `entry`
    pub fn remove_entry(&self, entry: &E) -> Result<E> {
        self.remove(&entry.key())
    }

    /// Remove several entries inside one transaction
    ///
    /// Every key is attempted; failures are collected into one
    /// [`MultiError`] instead of stopping at the first.
    pub fn remove_all(&self, keys: impl IntoIterator<Item = E::Key>) -> Result<Vec<E>> {
        let _tx = self.transaction()?;
        let mut removed = Vec::new();
        let mut failures = Vec::new();

        for key in keys {
            match self.remove(&key) {
                Ok(entry) => removed.push(entry),
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            let message = format!(
                "{} of {} removal(s) from {} failed",
                failures.len(),
                failures.len() + removed.len(),
                self.name
            );
            Err(MultiError::new(message, failures).into())
        }
    }

    /// Swap the whole content in one transaction
    pub fn replace_all(&self, entries: Vec<E>) -> Result<()> {
        let tx = self.transaction()?;
        self.check_write_access()?;

        let mut map = EntryMap::<E>::with_capacity(entries.len());
        for entry in &entries {
            if map.insert(entry.key(), entry.clone()).is_some() {
                return Err(RegistryError::AlreadyExists {
                    registry: self.name.clone(),
                    key: entry.key().to_string(),
                });
            }
        }

        let staged = map.clone();
        self.apply(
            move |sandbox| {
                sandbox.replace_all(staged);
                Ok(())
            },
            |store| {
                store.replace_all(map);
                Ok(())
            },
        )?;

        self.plugins.after_registry_change();
        drop(tx);

        self.publish(RegistryEvent::Replaced(entries));
        Ok(())
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        let tx = self.transaction()?;
        self.check_write_access()?;
        self.plugins.before_clear()?;

        self.apply(
            |sandbox| {
                sandbox.clear();
                Ok(())
            },
            |store| {
                store.clear();
                Ok(())
            },
        )?;

        self.plugins.after_clear();
        self.plugins.after_registry_change();
        drop(tx);

        self.publish(RegistryEvent::Cleared);
        Ok(())
    }

    // ===== Reads =====

    /// Look up an entry; a miss reports the neighboring keys
    pub fn get(&self, key: &E::Key) -> Result<E> {
        self.plugins.before_get(key);
        let entry = self.store.require(key)?;
        self.plugins.after_get(&entry);
        Ok(entry)
    }

    /// Copy of every entry
    pub fn entries(&self) -> Vec<E> {
        self.store.entries()
    }

    /// Read-only view of the live map, holding the read lock while alive
    ///
    /// Drop the view before writing to this registry from the same thread;
    /// a write while it is alive deadlocks. Use [`entries`](Self::entries)
    /// for a copy that can outlive a write.
    pub fn entry_map(&self) -> EntryMapView<'_, E> {
        self.store.view()
    }

    pub fn contains_key(&self, key: &E::Key) -> bool {
        self.store.contains_key(key)
    }

    /// Whether an entry with the key of `entry` is stored
    pub fn contains(&self, entry: &E) -> bool {
        self.store.contains_key(&entry.key())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    // ===== State =====

    /// Whether the last consistency run converged, or was forced
    pub fn is_consistent(&self) -> bool {
        self.consistent.load(Ordering::SeqCst)
    }

    /// Whether the write-access precheck currently fails
    pub fn is_read_only(&self) -> bool {
        self.check_write_access().is_err()
    }

    /// Usable right now: running, consistent, not locked by another thread,
    /// and every direct dependency is the same
    pub fn is_ready(&self) -> bool {
        self.is_locally_ready() && self.dependencies.all_ready()
    }

    // Dependencies are only asked for their own state, so cycles terminate.
    fn is_locally_ready(&self) -> bool {
        !self.is_shut_down() && self.is_consistent() && !self.lock.write_lock().is_held_elsewhere()
    }

    /// Always `false`: a registry is never its own sandbox
    ///
    /// The shadow copy is internal and not reachable as a `Registry`.
    /// Handlers that must behave differently during staging check
    /// [`CheckContext::is_sandbox`] instead.
    pub fn is_sandbox(&self) -> bool {
        false
    }

    pub fn sandbox_mode(&self) -> SandboxMode {
        self.sandbox.mode()
    }

    pub fn is_foreign(&self) -> bool {
        self.foreign
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn is_force_mode(&self) -> bool {
        self.force_mode.load(Ordering::SeqCst)
    }

    /// Accept commits whose consistency check fails, for manual repair
    pub fn set_force_mode(&self, force: bool) {
        self.force_mode.store(force, Ordering::SeqCst);
        info!(registry = %self.name, force, "force mode changed");
    }

    /// Keys on which sandbox and live map currently differ
    pub fn diverging_sandbox_keys(&self) -> Vec<E::Key> {
        self.sandbox.diverging_keys(&self.store)
    }

    // ===== Consistency =====

    pub fn add_handler(&self, handler: Arc<dyn ConsistencyHandler<E>>) {
        self.handlers.write().push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Run the consistency engine under the transaction lock
    ///
    /// Returns the number of entries rewritten by handlers.
    pub fn check_consistency(&self) -> Result<usize> {
        let tx = self.transaction()?;
        let outcome = self.run_consistency_check();
        self.sandbox.sync_from(&self.store);
        drop(tx);

        let modifications = outcome?;
        if modifications > 0 {
            self.publish(RegistryEvent::Revalidated);
        }
        Ok(modifications)
    }

    fn run_consistency_check(&self) -> Result<usize> {
        let guard = self.check_guard.lock();
        if guard.get() {
            debug!(registry = %self.name, "consistency check already running on this thread");
            return Ok(0);
        }
        guard.set(true);
        let _running = RunningCheck(&guard);

        if let Some(upstream) = self.dependencies.first_inconsistent() {
            debug!(registry = %self.name, upstream = %upstream, "consistency check skipped: dependency inconsistent");
            return Ok(0);
        }

        let handlers = self.handlers.read().clone();
        if handlers.is_empty() || self.store.is_empty() {
            self.consistent.store(true, Ordering::SeqCst);
            return Ok(0);
        }

        self.plugins.before_consistency_check();
        let ctx = CheckContext::new(&self.name, false);
        match self.engine.run(&self.store, &handlers, &ctx, &self.plugins) {
            Ok(outcome) => {
                self.consistent.store(true, Ordering::SeqCst);
                debug!(
                    registry = %self.name,
                    modifications = outcome.modifications,
                    iterations = outcome.iterations,
                    "consistency check converged"
                );
                self.plugins.after_consistency_check()?;
                Ok(outcome.modifications)
            }
            Err(err) => {
                self.consistent.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    // ===== Transactions =====

    /// Lock this registry and everything it depends on
    ///
    /// Mutations made while the guard is alive join its transaction.
    /// Rejected on foreign registries.
    pub fn lock(&self) -> Result<TransactionGuard<'_, E>> {
        if self.foreign {
            return Err(RegistryError::rejected(
                &self.name,
                "foreign registries cannot be locked externally",
            ));
        }
        self.transaction()
    }

    /// Break a pending lock retry loop on this registry
    pub fn interrupt(&self) {
        self.lock.interrupt();
    }

    fn transaction(&self) -> Result<TransactionGuard<'_, E>> {
        self.ensure_active()?;
        self.lock.lock(&|| self.dependencies.upstreams())?;
        Ok(TransactionGuard { registry: self })
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown {
                registry: self.name.clone(),
            });
        }
        Ok(())
    }

    fn check_write_access(&self) -> Result<()> {
        if let Some(upstream) = self.dependencies.first_inconsistent() {
            return Err(RegistryError::rejected(
                &self.name,
                format!("dependency {} is inconsistent", upstream),
            ));
        }
        if !self.is_consistent() && !self.is_force_mode() {
            return Err(RegistryError::rejected(
                &self.name,
                "registry is inconsistent; enable force mode to repair",
            ));
        }
        self.plugins.check_access()
    }

    /// Stage in the sandbox, commit live, then check and resync
    fn apply<T>(
        &self,
        stage: impl FnOnce(&Sandbox<E>) -> Result<()>,
        commit: impl FnOnce(&EntryStore<E>) -> Result<T>,
    ) -> Result<T> {
        self.plugins.before_registry_change();
        self.stage(stage)?;

        let backup = Backup {
            entries: self.store.snapshot(),
            consistent: self.is_consistent(),
        };
        let value = match commit(&self.store) {
            Ok(value) => value,
            Err(err) => {
                self.sandbox.sync_from(&self.store);
                return Err(err);
            }
        };

        self.finish_transaction(backup)?;
        Ok(value)
    }

    fn stage(&self, stage: impl FnOnce(&Sandbox<E>) -> Result<()>) -> Result<()> {
        if let Err(err) = stage(&self.sandbox) {
            self.sandbox.sync_from(&self.store);
            return Err(err);
        }
        if let Err(err) = self.sandbox.verify() {
            if !self.is_force_mode() {
                self.sandbox.sync_from(&self.store);
                return Err(err);
            }
            warn!(registry = %self.name, error = %err, "sandbox rejected mutation; continuing in force mode");
        }
        Ok(())
    }

    fn finish_transaction(&self, backup: Backup<E>) -> Result<()> {
        if let Err(err) = self.run_consistency_check() {
            if !self.is_force_mode() {
                self.store.replace_all(backup.entries);
                self.consistent.store(backup.consistent, Ordering::SeqCst);
                self.sandbox.sync_from(&self.store);
                return Err(err);
            }
            warn!(registry = %self.name, error = %err, "consistency check failed; commit forced");
        }
        self.sandbox.sync_from(&self.store);
        Ok(())
    }

    /// Tell dependents, then observers, about a committed change
    fn publish(&self, event: RegistryEvent<E>) {
        self.dependents.notify(&self.name);
        self.observers.notify(&self.name, &event);
    }

    // ===== Dependencies =====

    /// Make this registry depend on `upstream`
    ///
    /// The edge holds `upstream` strongly. Registries wired into a cycle keep
    /// each other alive until one of them is [shut down](Self::shutdown).
    pub fn register_dependency(&self, upstream: Arc<dyn Upstream>) -> Result<()> {
        self.ensure_active()?;
        self.dependencies.register(upstream, self.as_dependent())
    }

    pub fn remove_dependency(&self, upstream: RegistryId) -> Result<()> {
        self.dependencies.remove(upstream)
    }

    /// Attach change listeners to every upstream
    pub fn activate_dependencies(&self) -> Result<()> {
        self.ensure_active()?;
        self.dependencies.activate(self.as_dependent());
        Ok(())
    }

    pub fn deactivate_dependencies(&self) {
        self.dependencies.deactivate();
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.len()
    }

    /// Transitive dependency closure as a graph
    pub fn dependency_topology(&self) -> DependencyTopology {
        dependency_topology(self.id, &self.name, self.dependencies.upstreams())
    }

    fn as_dependent(&self) -> Weak<dyn Dependent> {
        let weak: Weak<dyn Dependent> = self.self_ref.clone();
        weak
    }

    // ===== Plugins & observers =====

    pub fn add_plugin(&self, plugin: Arc<dyn RegistryPlugin<E>>) {
        self.plugins.add(plugin);
    }

    pub fn add_observer(&self, observer: Observer<E>) -> ObserverId {
        self.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    // ===== Shutdown =====

    /// Tear the registry down
    ///
    /// Waits for the running transaction, then releases dependencies,
    /// handlers, plugins, observers and the sandbox content. Every later
    /// transaction fails with [`RegistryError::ShutDown`].
    pub fn shutdown(&self) -> Result<()> {
        if self.is_shut_down() {
            return Ok(());
        }
        self.lock.begin_shutdown();
        self.lock.lock(&|| Vec::new())?;
        let _tx = TransactionGuard { registry: self };

        self.shut_down.store(true, Ordering::SeqCst);
        self.dependencies.clear();
        self.handlers.write().clear();
        self.plugins.shutdown();
        self.observers.clear();
        self.dependents.clear();
        self.sandbox.clear();

        info!(registry = %self.name, entries = self.store.len(), "registry shut down");
        Ok(())
    }
}

impl<E: Entry> Upstream for Registry<E> {
    fn id(&self) -> RegistryId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_consistent(&self) -> bool {
        Registry::is_consistent(self)
    }

    fn is_ready(&self) -> bool {
        self.is_locally_ready()
    }

    fn write_lock(&self) -> Arc<WriteLock> {
        self.lock.write_lock()
    }

    fn upstreams(&self) -> Vec<Arc<dyn Upstream>> {
        self.dependencies.upstreams()
    }

    fn add_dependent(&self, dependent: Weak<dyn Dependent>) -> ListenerId {
        self.dependents.add(dependent)
    }

    fn remove_dependent(&self, listener: ListenerId) {
        self.dependents.remove(listener);
    }
}

impl<E: Entry> Dependent for Registry<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_upstream_changed(&self, upstream: &str) -> Result<()> {
        if self.is_shut_down() {
            return Ok(());
        }
        self.plugins.before_upstream_dependency_notification(upstream);

        let tx = self.transaction()?;
        let outcome = self.run_consistency_check();
        self.sandbox.sync_from(&self.store);
        drop(tx);

        self.plugins.after_upstream_dependency_notification(upstream);
        let modifications = outcome?;
        debug!(registry = %self.name, upstream, modifications, "revalidated after upstream change");
        if modifications > 0 {
            self.publish(RegistryEvent::Revalidated);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::{handler_fn, Verdict};
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Account {
        id: String,
        balance: i64,
    }

    impl Entry for Account {
        type Key = String;

        fn key(&self) -> String {
            self.id.clone()
        }
    }

    fn account(id: &str, balance: i64) -> Account {
        Account {
            id: id.to_string(),
            balance,
        }
    }

    fn no_overdraft() -> impl ConsistencyHandler<Account> {
        handler_fn(
            "no-overdraft",
            |entry: &Account, _: &EntryMap<Account>, ctx: &CheckContext<'_>| {
                if entry.balance < 0 {
                    Verdict::Failed(RegistryError::verification(ctx.registry(), &entry.id, "overdrawn"))
                } else {
                    Verdict::Unchanged
                }
            },
        )
    }

    #[test]
    fn test_register_get_remove() {
        let accounts = Registry::new("accounts");
        accounts.register(account("alice", 10)).unwrap();
        accounts.register(account("carol", 5)).unwrap();

        assert_eq!(accounts.get(&"alice".to_string()).unwrap().balance, 10);
        assert!(accounts.contains(&account("carol", 0)));
        assert_eq!(accounts.remove(&"alice".to_string()).unwrap().balance, 10);
        assert_eq!(accounts.len(), 1);
        assert!(accounts.is_consistent());
    }

    #[test]
    fn test_get_miss_reports_neighbors() {
        let accounts = Registry::new("accounts");
        accounts.register(account("Alice", 1)).unwrap();
        accounts.register(account("carol", 1)).unwrap();

        let err = accounts.get(&"bob".to_string()).unwrap_err();
        match err {
            RegistryError::NotAvailable { neighbors, .. } => {
                assert_eq!(neighbors, vec!["Alice".to_string(), "carol".to_string()])
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_sandbox_rejection_leaves_live_map_untouched() {
        let accounts = Registry::builder("accounts").handler(no_overdraft()).build();
        accounts.register(account("alice", 10)).unwrap();

        let err = accounts.update(account("alice", -5)).unwrap_err();
        assert!(err.is_multi());
        assert_eq!(accounts.get(&"alice".to_string()).unwrap().balance, 10);
        assert!(accounts.is_consistent());
        assert!(accounts.diverging_sandbox_keys().is_empty());
    }

    #[test]
    fn test_live_failure_rolls_back_without_sandbox() {
        let accounts = Registry::builder("accounts")
            .handler(no_overdraft())
            .without_sandbox()
            .build();
        accounts.register(account("alice", 10)).unwrap();

        assert!(accounts.update(account("alice", -5)).is_err());
        assert_eq!(accounts.get(&"alice".to_string()).unwrap().balance, 10);
        assert!(accounts.is_consistent());
    }

    #[test]
    fn test_force_mode_keeps_mutation_and_flags_inconsistent() {
        let accounts = Registry::builder("accounts").handler(no_overdraft()).build();
        accounts.register(account("alice", 10)).unwrap();
        accounts.set_force_mode(true);

        accounts.update(account("alice", -5)).unwrap();
        assert!(!accounts.is_consistent());
        assert!(!accounts.is_read_only());

        accounts.set_force_mode(false);
        assert!(accounts.is_read_only());
        assert!(matches!(
            accounts.register(account("bob", 1)),
            Err(RegistryError::Rejected { .. })
        ));

        accounts.set_force_mode(true);
        accounts.update(account("alice", 0)).unwrap();
        assert!(accounts.is_consistent());
        assert!(accounts.diverging_sandbox_keys().is_empty());
    }

    #[test]
    fn test_remove_all_collects_failures() {
        let accounts = Registry::new("accounts");
        accounts.register(account("alice", 1)).unwrap();
        accounts.register(account("bob", 1)).unwrap();

        let err = accounts
            .remove_all(vec!["alice".to_string(), "zed".to_string(), "bob".to_string()])
            .unwrap_err();
        match err {
            RegistryError::Multi(multi) => {
                assert_eq!(multi.len(), 1);
                assert!(matches!(multi.causes()[0], RegistryError::NotAvailable { .. }));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(accounts.is_empty());
    }

    #[test]
    fn test_replace_all_and_clear_emit_events() {
        let accounts = Registry::new("accounts");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        accounts.add_observer(Arc::new(move |event: &RegistryEvent<Account>| -> Result<()> {
            sink.lock().push(event.clone());
            Ok(())
        }));

        accounts.register(account("alice", 1)).unwrap();
        accounts
            .replace_all(vec![account("bob", 2), account("carol", 3)])
            .unwrap();
        assert_eq!(accounts.len(), 2);
        assert!(!accounts.contains_key(&"alice".to_string()));

        accounts.clear().unwrap();
        assert!(accounts.is_empty());
        assert_eq!(events.lock().len(), 3);
        assert_eq!(events.lock()[2], RegistryEvent::Cleared);
    }

    #[test]
    fn test_replace_all_rejects_duplicate_keys() {
        let accounts = Registry::new("accounts");
        accounts.register(account("alice", 1)).unwrap();
        let err = accounts
            .replace_all(vec![account("bob", 1), account("bob", 2)])
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }));
        assert!(accounts.contains_key(&"alice".to_string()));
    }

    #[test]
    fn test_explicit_transaction_nests_mutations() {
        let accounts = Registry::new("accounts");
        {
            let tx = accounts.lock().unwrap();
            accounts.register(account("alice", 1)).unwrap();
            accounts.register(account("bob", 1)).unwrap();
            assert_eq!(tx.depth(), 1);
            assert_eq!(tx.locked_registries(), 1);
        }
        assert!(!accounts.lock.write_lock().is_locked());
        assert_eq!(accounts.len(), 2);
    }

    #[test]
    fn test_foreign_registry_rejects_external_lock() {
        let mirror: Arc<Registry<Account>> = Registry::builder("mirror").foreign().build();
        assert!(matches!(mirror.lock(), Err(RegistryError::Rejected { .. })));
        mirror.register(account("alice", 1)).unwrap();
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_inconsistent_dependency_blocks_writes() {
        let ledger = Registry::builder("ledger").handler(no_overdraft()).build();
        let accounts: Arc<Registry<Account>> = Registry::new("accounts");
        accounts.register_dependency(ledger.clone()).unwrap();

        ledger.register(account("alice", 1)).unwrap();
        ledger.set_force_mode(true);
        ledger.update(account("alice", -1)).unwrap();
        assert!(!ledger.is_consistent());

        assert!(accounts.is_read_only());
        assert!(!accounts.is_ready());
        assert!(matches!(
            accounts.register(account("bob", 1)),
            Err(RegistryError::Rejected { .. })
        ));
    }

    #[test]
    fn test_upstream_change_revalidates_dependent() {
        let upstream: Arc<Registry<Account>> = Registry::new("limits");
        let checks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = checks.clone();
        let dependent: Arc<Registry<Account>> = Registry::builder("accounts")
            .handler(handler_fn(
                "counting",
                move |_: &Account, _: &EntryMap<Account>, _: &CheckContext<'_>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Verdict::Unchanged
                },
            ))
            .build();
        dependent.register(account("alice", 1)).unwrap();
        dependent.register_dependency(upstream.clone()).unwrap();
        dependent.activate_dependencies().unwrap();
        assert_eq!(upstream.dependent_count(), 1);

        let before = checks.load(Ordering::SeqCst);
        upstream.register(account("cap", 100)).unwrap();
        assert!(checks.load(Ordering::SeqCst) > before);

        dependent.deactivate_dependencies();
        assert_eq!(upstream.dependent_count(), 0);
    }

    #[test]
    fn test_shutdown_rejects_further_work() {
        let accounts = Registry::builder("accounts").handler(no_overdraft()).build();
        accounts.register(account("alice", 1)).unwrap();
        accounts.shutdown().unwrap();

        assert!(accounts.is_shut_down());
        assert!(!accounts.is_ready());
        assert_eq!(accounts.handler_count(), 0);
        assert!(matches!(
            accounts.register(account("bob", 1)),
            Err(RegistryError::ShutDown { .. })
        ));
        accounts.shutdown().unwrap();
    }

    #[derive(Default)]
    struct HookLog {
        calls: Mutex<Vec<String>>,
    }

    impl RegistryPlugin<Account> for HookLog {
        fn before_upstream_dependency_notification(&self, upstream: &str) {
            self.calls.lock().push(format!("before notification {upstream}"));
        }

        fn after_upstream_dependency_notification(&self, upstream: &str) {
            self.calls.lock().push(format!("after notification {upstream}"));
        }

        fn before_registry_change(&self) {
            self.calls.lock().push("before change".to_string());
        }

        fn after_registry_change(&self) {
            self.calls.lock().push("after change".to_string());
        }
    }

    #[test]
    fn test_change_and_notification_hooks_are_paired() {
        let log = Arc::new(HookLog::default());
        let limits: Arc<Registry<Account>> = Registry::new("limits");
        let accounts: Arc<Registry<Account>> = Registry::builder("accounts")
            .handler(no_overdraft())
            .plugin(log.clone())
            .build();
        accounts.register_dependency(limits.clone()).unwrap();
        accounts.activate_dependencies().unwrap();

        accounts.register(account("alice", 1)).unwrap();
        limits.register(account("cap", 100)).unwrap();

        assert_eq!(
            *log.calls.lock(),
            vec![
                "before change",
                "after change",
                "before notification limits",
                "after notification limits",
            ]
        );
    }

    /// Calls back into its registry from `after_consistency_check`
    #[derive(Default)]
    struct NestedCheck {
        registry: Mutex<Weak<Registry<Account>>>,
        results: Mutex<Vec<std::result::Result<usize, String>>>,
    }

    impl RegistryPlugin<Account> for NestedCheck {
        fn after_consistency_check(&self) -> Result<()> {
            if let Some(registry) = self.registry.lock().upgrade() {
                let result = registry.check_consistency().map_err(|e| e.to_string());
                self.results.lock().push(result);
            }
            Ok(())
        }
    }

    #[test]
    fn test_nested_check_on_same_thread_returns_zero() {
        let nested = Arc::new(NestedCheck::default());
        let accounts = Registry::builder("accounts")
            .handler(no_overdraft())
            .plugin(nested.clone())
            .build();
        *nested.registry.lock() = Arc::downgrade(&accounts);

        accounts.register(account("alice", 1)).unwrap();
        assert_eq!(*nested.results.lock(), vec![Ok(0)]);
        assert!(accounts.is_consistent());
        assert!(!accounts.lock.write_lock().is_locked());
    }

    #[test]
    fn test_check_skipped_while_dependency_inconsistent() {
        let ledger = Registry::builder("ledger").handler(no_overdraft()).build();
        ledger.register(account("alice", 1)).unwrap();
        ledger.set_force_mode(true);
        ledger.update(account("alice", -1)).unwrap();

        let accounts = Registry::builder("accounts").handler(no_overdraft()).build();
        accounts.register(account("bob", 1)).unwrap();
        accounts.set_force_mode(true);
        accounts.update(account("bob", -1)).unwrap();
        assert!(!accounts.is_consistent());

        accounts.register_dependency(ledger.clone()).unwrap();
        assert_eq!(accounts.check_consistency().unwrap(), 0);
        assert!(!accounts.is_consistent());

        ledger.update(account("alice", 0)).unwrap();
        assert!(ledger.is_consistent());
        assert!(accounts.check_consistency().is_err());
    }

    #[test]
    fn test_shutdown_frees_dependency_cycle() {
        let a: Arc<Registry<Account>> = Registry::new("a");
        let b: Arc<Registry<Account>> = Registry::new("b");
        a.register_dependency(b.clone()).unwrap();
        b.register_dependency(a.clone()).unwrap();
        let weak_a = Arc::downgrade(&a);
        let weak_b = Arc::downgrade(&b);

        a.shutdown().unwrap();
        b.shutdown().unwrap();
        drop(a);
        drop(b);
        assert!(weak_a.upgrade().is_none());
        assert!(weak_b.upgrade().is_none());
    }

    #[test]
    fn test_sandbox_runs_are_only_visible_to_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let accounts = Registry::builder("accounts")
            .handler(handler_fn(
                "sandbox-flag",
                move |_: &Account, _: &EntryMap<Account>, ctx: &CheckContext<'_>| {
                    sink.lock().push(ctx.is_sandbox());
                    Verdict::Unchanged
                },
            ))
            .build();

        accounts.register(account("alice", 1)).unwrap();
        assert!(!accounts.is_sandbox());
        assert!(seen.lock().contains(&true));
        assert!(seen.lock().contains(&false));
    }

    #[test]
    fn test_entry_map_view_then_write() {
        let accounts = Registry::new("accounts");
        accounts.register(account("alice", 1)).unwrap();
        {
            let view = accounts.entry_map();
            assert_eq!(view.len(), 1);
        }
        accounts.register(account("bob", 2)).unwrap();
        assert_eq!(accounts.entries().len(), 2);
    }
}
