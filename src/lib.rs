//! Familiar Registry
//!
//! An in-process, consistency-checked registry of keyed entries for the
//! Familiar platform.
//!
//! ## Features
//!
//! - **Consistency Handlers**: pluggable rules that inspect and repair entries,
//!   run to a fixed point after every commit
//! - **Sandboxed Commits**: every mutation is validated on a shadow copy
//!   before it touches the live map
//! - **Dependency-Aware Locking**: transactions lock every registry they
//!   depend on without ever blocking on a partial lock set
//! - **Change Propagation**: dependents re-check themselves when an upstream
//!   registry changes
//! - **Diff-Based Sync**: mirror an external snapshot with rate-limited,
//!   fault-isolated reconciliation
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!   Synchronizer ─►│   Registry   │◄── plugins / observers
//!                  └──────┬───────┘
//!        ┌────────────┬───┴────────┬──────────────┐
//!        ▼            ▼            ▼              ▼
//!   EntryStore     Sandbox   Consistency    LockCoordinator
//!                  (shadow)     Engine             │
//!                                                  ▼
//!                                           DependencyGraph ──► upstream registries
//! ```

pub mod config;
pub mod consistency;
pub mod dependency;
pub mod entry;
pub mod error;
pub mod hooks;
pub mod lock;
pub mod registry;
pub mod sandbox;
pub mod store;
pub mod sync;

pub use config::EngineConfig;
pub use consistency::{
    handler_fn, CheckContext, CheckOutcome, ConsistencyEngine, ConsistencyHandler, Verdict,
};
pub use dependency::{Dependent, DependencyTopology, Upstream};
pub use entry::{Entry, EntryMap, RegistryKey};
pub use error::{MultiError, RegistryError, Result};
pub use hooks::{Observer, ObserverId, RegistryEvent, RegistryPlugin};
pub use lock::{Jitter, RegistryId};
pub use registry::{Registry, RegistryBuilder, TransactionGuard};
pub use sandbox::SandboxMode;
pub use store::{EntryMapView, EntryStore};
pub use sync::{
    DataProvider, DirectActions, ProviderObserver, SyncActions, SyncContext, SyncFilter,
    SyncReport, Synchronizer,
};
