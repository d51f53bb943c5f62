//! Registry Dependency Graph
//!
//! A registry may depend on other registries ("upstreams"). An edge has two
//! effects:
//! - transactions on the dependent lock the upstream as well, see
//!   [`crate::lock::LockCoordinator`]
//! - once activated, a listener on the upstream re-runs the dependent's
//!   consistency check whenever the upstream changes
//!
//! Registries of different entry types share one graph, so the edge targets
//! are trait objects.

pub mod analysis;

pub use analysis::{dependency_topology, DependencyTopology};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{RegistryError, Result};
use crate::lock::{RegistryId, WriteLock};

/// Handle of a dependent listener registered on an upstream
pub type ListenerId = u64;

/// A registry other registries can depend on
pub trait Upstream: Send + Sync {
    fn id(&self) -> RegistryId;
    fn name(&self) -> &str;
    fn is_consistent(&self) -> bool;
    /// Ready on its own; must not consult the registry's own upstreams
    fn is_ready(&self) -> bool;
    /// The lock taken when a dependent's transaction walks through this registry
    fn write_lock(&self) -> Arc<WriteLock>;
    /// Direct upstreams of this registry
    fn upstreams(&self) -> Vec<Arc<dyn Upstream>>;
    fn add_dependent(&self, dependent: Weak<dyn Dependent>) -> ListenerId;
    fn remove_dependent(&self, listener: ListenerId);
}

/// A registry that reacts to upstream changes
pub trait Dependent: Send + Sync {
    fn name(&self) -> &str;
    fn on_upstream_changed(&self, upstream: &str) -> Result<()>;
}

/// One upstream of a registry
pub struct DependencyEdge {
    upstream: Arc<dyn Upstream>,
    /// Set while the change listener is attached
    listener: Option<ListenerId>,
}

impl DependencyEdge {
    pub fn upstream(&self) -> &Arc<dyn Upstream> {
        &self.upstream
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }
}

/// The upstream edges of one registry
pub struct DependencyGraph {
    owner: String,
    owner_id: RegistryId,
    edges: RwLock<Vec<DependencyEdge>>,
    activated: AtomicBool,
}

impl DependencyGraph {
    pub fn new(owner: impl Into<String>, owner_id: RegistryId) -> Self {
        Self {
            owner: owner.into(),
            owner_id,
            edges: RwLock::new(Vec::new()),
            activated: AtomicBool::new(false),
        }
    }

    /// Add an upstream; attaches the listener right away once activated
    pub fn register(&self, upstream: Arc<dyn Upstream>, dependent: Weak<dyn Dependent>) -> Result<()> {
        if upstream.id() == self.owner_id {
            return Err(RegistryError::InvalidState(format!(
                "{} cannot depend on itself",
                self.owner
            )));
        }

        let mut edges = self.edges.write();
        if edges.iter().any(|edge| edge.upstream.id() == upstream.id()) {
            return Err(RegistryError::InvalidState(format!(
                "{} already depends on {}",
                self.owner,
                upstream.name()
            )));
        }

        let listener = if self.is_activated() {
            Some(upstream.add_dependent(dependent))
        } else {
            None
        };
        debug!(registry = %self.owner, upstream = upstream.name(), "dependency registered");
        edges.push(DependencyEdge { upstream, listener });
        Ok(())
    }

    /// Remove an upstream and detach its listener
    pub fn remove(&self, upstream: RegistryId) -> Result<()> {
        let mut edges = self.edges.write();
        let Some(position) = edges.iter().position(|edge| edge.upstream.id() == upstream) else {
            return Err(RegistryError::InvalidState(format!(
                "{} has no dependency with id {}",
                self.owner, upstream
            )));
        };
        let edge = edges.remove(position);
        if let Some(listener) = edge.listener {
            edge.upstream.remove_dependent(listener);
        }
        Ok(())
    }

    /// Attach the change listener of every edge
    pub fn activate(&self, dependent: Weak<dyn Dependent>) {
        let mut edges = self.edges.write();
        for edge in edges.iter_mut().filter(|edge| edge.listener.is_none()) {
            edge.listener = Some(edge.upstream.add_dependent(dependent.clone()));
        }
        self.activated.store(true, Ordering::SeqCst);
    }

    /// Detach all listeners, keeping the edges
    pub fn deactivate(&self) {
        let mut edges = self.edges.write();
        for edge in edges.iter_mut() {
            if let Some(listener) = edge.listener.take() {
                edge.upstream.remove_dependent(listener);
            }
        }
        self.activated.store(false, Ordering::SeqCst);
    }

    /// Detach and drop every edge
    pub fn clear(&self) {
        self.deactivate();
        self.edges.write().clear();
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.edges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.read().is_empty()
    }

    pub fn upstreams(&self) -> Vec<Arc<dyn Upstream>> {
        self.edges
            .read()
            .iter()
            .map(|edge| edge.upstream.clone())
            .collect()
    }

    /// Name of the first upstream that is currently inconsistent
    pub fn first_inconsistent(&self) -> Option<String> {
        self.edges
            .read()
            .iter()
            .find(|edge| !edge.upstream.is_consistent())
            .map(|edge| edge.upstream.name().to_string())
    }

    pub fn all_ready(&self) -> bool {
        self.edges.read().iter().all(|edge| edge.upstream.is_ready())
    }
}

/// Listeners of the registries depending on one upstream
pub struct DependentSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Weak<dyn Dependent>)>>,
}

impl Default for DependentSet {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl DependentSet {
    pub fn add(&self, dependent: Weak<dyn Dependent>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, dependent));
        id
    }

    pub fn remove(&self, listener: ListenerId) {
        self.listeners.write().retain(|(id, _)| *id != listener);
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Tell every live dependent that `upstream` changed
    ///
    /// Best effort: failures are logged, dropped dependents are pruned.
    pub fn notify(&self, upstream: &str) {
        let live: Vec<Arc<dyn Dependent>> = {
            let mut listeners = self.listeners.write();
            listeners.retain(|(_, dependent)| dependent.strong_count() > 0);
            listeners
                .iter()
                .filter_map(|(_, dependent)| dependent.upgrade())
                .collect()
        };

        for dependent in live {
            if let Err(err) = dependent.on_upstream_changed(upstream) {
                warn!(
                    upstream,
                    dependent = dependent.name(),
                    error = %err,
                    "dependent failed to process upstream change"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::next_registry_id;
    use parking_lot::Mutex;

    struct Node {
        id: RegistryId,
        name: String,
        consistent: AtomicBool,
        lock: Arc<WriteLock>,
        dependents: DependentSet,
    }

    impl Node {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                id: next_registry_id(),
                name: name.to_string(),
                consistent: AtomicBool::new(true),
                lock: Arc::new(WriteLock::new(name)),
                dependents: DependentSet::default(),
            })
        }
    }

    impl Upstream for Node {
        fn id(&self) -> RegistryId {
            self.id
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn is_consistent(&self) -> bool {
            self.consistent.load(Ordering::SeqCst)
        }
        fn is_ready(&self) -> bool {
            self.is_consistent()
        }
        fn write_lock(&self) -> Arc<WriteLock> {
            self.lock.clone()
        }
        fn upstreams(&self) -> Vec<Arc<dyn Upstream>> {
            Vec::new()
        }
        fn add_dependent(&self, dependent: Weak<dyn Dependent>) -> ListenerId {
            self.dependents.add(dependent)
        }
        fn remove_dependent(&self, listener: ListenerId) {
            self.dependents.remove(listener)
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Dependent for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn on_upstream_changed(&self, upstream: &str) -> Result<()> {
            self.seen.lock().push(upstream.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_listener_attached_on_activation() {
        let upstream = Node::new("locations");
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Dependent> = Arc::downgrade(&recorder) as Weak<dyn Dependent>;

        let graph = DependencyGraph::new("units", next_registry_id());
        graph.register(upstream.clone(), weak.clone()).unwrap();
        assert_eq!(upstream.dependents.len(), 0);

        graph.activate(weak);
        assert_eq!(upstream.dependents.len(), 1);

        upstream.dependents.notify("locations");
        assert_eq!(*recorder.seen.lock(), vec!["locations".to_string()]);

        graph.remove(upstream.id).unwrap();
        assert_eq!(upstream.dependents.len(), 0);
        assert!(graph.is_empty());
    }

    #[test]
    fn test_duplicate_and_self_edges_rejected() {
        let upstream = Node::new("locations");
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Dependent> = Arc::downgrade(&recorder) as Weak<dyn Dependent>;

        let graph = DependencyGraph::new("locations", upstream.id);
        assert!(graph.register(upstream.clone(), weak.clone()).is_err());

        let graph = DependencyGraph::new("units", next_registry_id());
        graph.register(upstream.clone(), weak.clone()).unwrap();
        assert!(graph.register(upstream, weak).is_err());
    }

    #[test]
    fn test_inconsistent_upstream_reported() {
        let upstream = Node::new("locations");
        let recorder = Arc::new(Recorder::default());
        let graph = DependencyGraph::new("units", next_registry_id());
        graph
            .register(upstream.clone(), Arc::downgrade(&recorder) as Weak<dyn Dependent>)
            .unwrap();

        assert!(graph.first_inconsistent().is_none());
        upstream.consistent.store(false, Ordering::SeqCst);
        assert_eq!(graph.first_inconsistent().as_deref(), Some("locations"));
        assert!(!graph.all_ready());
    }

    #[test]
    fn test_dropped_dependents_pruned() {
        let set = DependentSet::default();
        {
            let recorder = Arc::new(Recorder::default());
            set.add(Arc::downgrade(&recorder) as Weak<dyn Dependent>);
        }
        set.notify("locations");
        assert!(set.is_empty());
    }
}
