//! Sandbox
//!
//! A disposable shadow copy of a registry's entries with the same handler
//! list. Mutations are replayed here first; the live store is touched only
//! if the shadow accepts them. After every live commit the shadow is
//! re-cloned from the live store.
//!
//! The sandbox has no plugins, observers, dependencies or locking.

use tracing::debug;

use crate::consistency::{CheckContext, CheckOutcome, ConsistencyEngine, HandlerList};
use crate::entry::{Entry, EntryMap};
use crate::error::Result;
use crate::store::EntryStore;

/// Sandbox flavour of a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    /// Deep-cloned shadow store validating every mutation
    Shadow,
    /// No isolation; every operation succeeds without doing anything
    Mock,
}

/// Shadow content of a [`Sandbox::Shadow`]
pub struct ShadowStore<E: Entry> {
    name: String,
    store: EntryStore<E>,
    handlers: HandlerList<E>,
    engine: ConsistencyEngine,
}

/// Pre-commit validation oracle of a registry
pub enum Sandbox<E: Entry> {
    Shadow(ShadowStore<E>),
    Mock,
}

impl<E: Entry> Sandbox<E> {
    /// Create a sandbox of the given mode for registry `registry`
    pub fn new(
        mode: SandboxMode,
        registry: &str,
        handlers: HandlerList<E>,
        engine: ConsistencyEngine,
    ) -> Self {
        match mode {
            SandboxMode::Shadow => {
                let name = format!("{}.sandbox", registry);
                Sandbox::Shadow(ShadowStore {
                    store: EntryStore::new(name.clone()),
                    name,
                    handlers,
                    engine,
                })
            }
            SandboxMode::Mock => Sandbox::Mock,
        }
    }

    pub fn mode(&self) -> SandboxMode {
        match self {
            Sandbox::Shadow(_) => SandboxMode::Shadow,
            Sandbox::Mock => SandboxMode::Mock,
        }
    }

    pub fn register(&self, entry: E) -> Result<()> {
        match self {
            Sandbox::Shadow(shadow) => shadow.store.insert_new(entry),
            Sandbox::Mock => Ok(()),
        }
    }

    pub fn update(&self, entry: E) -> Result<()> {
        match self {
            Sandbox::Shadow(shadow) => shadow.store.replace_existing(entry).map(|_| ()),
            Sandbox::Mock => Ok(()),
        }
    }

    pub fn remove(&self, key: &E::Key) -> Result<()> {
        match self {
            Sandbox::Shadow(shadow) => shadow.store.remove(key).map(|_| ()),
            Sandbox::Mock => Ok(()),
        }
    }

    pub fn replace_all(&self, entries: EntryMap<E>) {
        if let Sandbox::Shadow(shadow) = self {
            shadow.store.replace_all(entries);
        }
    }

    pub fn clear(&self) {
        if let Sandbox::Shadow(shadow) = self {
            shadow.store.clear();
        }
    }

    /// Run the consistency engine over the shadow content
    pub fn verify(&self) -> Result<CheckOutcome> {
        match self {
            Sandbox::Shadow(shadow) => {
                let handlers = shadow.handlers.read().clone();
                let ctx = CheckContext::new(&shadow.name, true);
                shadow.engine.run(&shadow.store, &handlers, &ctx, &())
            }
            Sandbox::Mock => Ok(CheckOutcome::default()),
        }
    }

    /// Re-clone the shadow from the live store
    pub fn sync_from(&self, live: &EntryStore<E>) {
        if let Sandbox::Shadow(shadow) = self {
            shadow.store.replace_all(live.snapshot());
            debug!(sandbox = %shadow.name, entries = shadow.store.len(), "sandbox resynchronized");
        }
    }

    /// Keys that differ between shadow and live store; always empty for a mock
    pub fn diverging_keys(&self, live: &EntryStore<E>) -> Vec<E::Key> {
        match self {
            Sandbox::Shadow(shadow) => shadow.store.diverging_keys(live),
            Sandbox::Mock => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Sandbox::Shadow(shadow) => shadow.store.len(),
            Sandbox::Mock => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
