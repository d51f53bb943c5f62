//! Consistency Engine
//!
//! Runs the registered consistency handlers over a store until one full pass
//! produces neither a modification nor a failure.
//!
//! ## Pass structure
//!
//! ```text
//! for handler in handlers (registration order):
//!     handler.reset()
//!     for entry in snapshot (key order):
//!         Unchanged      -> continue
//!         Modified(e)    -> write e, restart from the first handler
//!         Failed(err)    -> record, continue
//! ```
//!
//! A run ends successfully on a clean pass. It aborts when
//! - the same handler modifies the same entry in two consecutive passes,
//! - a pass without modifications fails exactly like the pass before it,
//! - the pass budget `handlers * entries * iteration_factor` is exhausted.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::entry::{Entry, EntryMap};
use crate::error::{MultiError, RegistryError, Result};
use crate::store::EntryStore;

// =============================================================================
// Handler API
// =============================================================================

/// Outcome of a single handler call
#[derive(Debug)]
pub enum Verdict<E> {
    /// The entry satisfies the rule
    Unchanged,
    /// The rule repaired the entry; the engine stores it and restarts the pass
    Modified(E),
    /// The rule is violated and cannot be repaired here
    Failed(RegistryError),
}

/// Context handed to every handler call
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    registry: &'a str,
    sandbox: bool,
}

impl<'a> CheckContext<'a> {
    pub fn new(registry: &'a str, sandbox: bool) -> Self {
        Self { registry, sandbox }
    }

    /// Name of the registry being checked
    pub fn registry(&self) -> &'a str {
        self.registry
    }

    /// True while validating a mutation in the sandbox
    ///
    /// Handlers with side effects outside the entry map should skip them here.
    pub fn is_sandbox(&self) -> bool {
        self.sandbox
    }
}

/// A consistency rule
///
/// Handlers are shared between a registry and its sandbox, so any state they
/// keep needs interior mutability and must be cleared in [`reset`].
///
/// [`reset`]: ConsistencyHandler::reset
pub trait ConsistencyHandler<E: Entry>: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called before every pass of this handler
    fn reset(&self) {}

    fn check(&self, entry: &E, entries: &EntryMap<E>, ctx: &CheckContext<'_>) -> Verdict<E>;
}

/// Handler backed by a closure
pub struct FnHandler<F> {
    name: String,
    check: F,
}

/// Wrap a closure as a named [`ConsistencyHandler`]
pub fn handler_fn<E, F>(name: impl Into<String>, check: F) -> FnHandler<F>
where
    E: Entry,
    F: Fn(&E, &EntryMap<E>, &CheckContext<'_>) -> Verdict<E> + Send + Sync,
{
    FnHandler {
        name: name.into(),
        check,
    }
}

impl<E, F> ConsistencyHandler<E> for FnHandler<F>
where
    E: Entry,
    F: Fn(&E, &EntryMap<E>, &CheckContext<'_>) -> Verdict<E> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, entry: &E, entries: &EntryMap<E>, ctx: &CheckContext<'_>) -> Verdict<E> {
        (self.check)(entry, entries, ctx)
    }
}

/// Handler list shared between a registry and its sandbox
pub type HandlerList<E> = Arc<RwLock<Vec<Arc<dyn ConsistencyHandler<E>>>>>;

/// Observer of entries rewritten by handlers
pub trait ModificationHooks<E> {
    fn before_modification(&self, _entry: &E) {}
    fn after_modification(&self, _entry: &E) {}
}

impl<E> ModificationHooks<E> for () {}

// =============================================================================
// Engine
// =============================================================================

/// Result of a converged run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Entries rewritten by handlers
    pub modifications: usize,
    /// Passes executed, including the final clean one
    pub iterations: usize,
}

/// A handler failure recorded during one pass
struct Failure {
    handler: String,
    key: String,
    error: RegistryError,
}

/// Iterative fixed-point runner
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyEngine {
    iteration_factor: usize,
}

impl Default for ConsistencyEngine {
    fn default() -> Self {
        Self::new(2)
    }
}

impl ConsistencyEngine {
    pub fn new(iteration_factor: usize) -> Self {
        Self {
            iteration_factor: iteration_factor.max(1),
        }
    }

    /// Pass budget for the given number of handlers and entries
    pub fn max_iterations(&self, handlers: usize, entries: usize) -> usize {
        handlers * entries * self.iteration_factor
    }

    /// Run all handlers over `store` until convergence
    pub fn run<E: Entry>(
        &self,
        store: &EntryStore<E>,
        handlers: &[Arc<dyn ConsistencyHandler<E>>],
        ctx: &CheckContext<'_>,
        hooks: &dyn ModificationHooks<E>,
    ) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();
        if handlers.is_empty() || store.is_empty() {
            return Ok(outcome);
        }

        let max_iterations = self.max_iterations(handlers.len(), store.len());
        let mut last_modification: Option<(usize, E::Key)> = None;
        let mut previous_failures: Option<BTreeSet<(String, String, String)>> = None;
        let mut failures: Vec<Failure> = Vec::new();

        loop {
            if outcome.iterations >= max_iterations {
                return Err(RegistryError::FatalImplementation {
                    registry: ctx.registry().to_string(),
                    message: format!(
                        "handler interference: no convergence within {} iterations",
                        max_iterations
                    ),
                    causes: failures.into_iter().map(|f| f.error).collect(),
                });
            }
            outcome.iterations += 1;
            failures.clear();

            let modified = self.pass(store, handlers, ctx, &mut failures)?;

            if let Some((index, entry)) = modified {
                let key = entry.key();
                if last_modification.as_ref() == Some(&(index, key.clone())) {
                    return Err(RegistryError::FatalImplementation {
                        registry: ctx.registry().to_string(),
                        message: format!(
                            "looping handler: {} modified {} in two consecutive passes",
                            handlers[index].name(),
                            key
                        ),
                        causes: Vec::new(),
                    });
                }

                hooks.before_modification(&entry);
                store.replace_existing(entry.clone())?;
                hooks.after_modification(&entry);
                debug!(
                    registry = ctx.registry(),
                    sandbox = ctx.is_sandbox(),
                    handler = handlers[index].name(),
                    key = %key,
                    "consistency handler modified entry"
                );

                outcome.modifications += 1;
                last_modification = Some((index, key));
                previous_failures = None;
                continue;
            }
            last_modification = None;

            if failures.is_empty() {
                return Ok(outcome);
            }

            let signature: BTreeSet<_> = failures
                .iter()
                .map(|f| (f.handler.clone(), f.key.clone(), f.error.to_string()))
                .collect();
            if previous_failures.as_ref() == Some(&signature) {
                let count = failures.len();
                return Err(MultiError::new(
                    format!(
                        "consistency check of {} failed with {} unresolved violation(s)",
                        ctx.registry(),
                        count
                    ),
                    failures.into_iter().map(|f| f.error).collect(),
                )
                .into());
            }
            previous_failures = Some(signature);
        }
    }

    /// One pass over all handlers
    ///
    /// Stops at the first modification and returns it with the index of the
    /// handler that produced it.
    fn pass<E: Entry>(
        &self,
        store: &EntryStore<E>,
        handlers: &[Arc<dyn ConsistencyHandler<E>>],
        ctx: &CheckContext<'_>,
        failures: &mut Vec<Failure>,
    ) -> Result<Option<(usize, E)>> {
        for (index, handler) in handlers.iter().enumerate() {
            handler.reset();

            let snapshot = store.snapshot();
            let mut keys: Vec<&E::Key> = snapshot.keys().collect();
            keys.sort();

            for key in keys {
                let entry = &snapshot[key];
                match handler.check(entry, &snapshot, ctx) {
                    Verdict::Unchanged => {}
                    Verdict::Modified(modified) => {
                        if &modified.key() != key {
                            return Err(RegistryError::FatalImplementation {
                                registry: ctx.registry().to_string(),
                                message: format!(
                                    "handler {} changed key {} to {}",
                                    handler.name(),
                                    key,
                                    modified.key()
                                ),
                                causes: Vec::new(),
                            });
                        }
                        return Ok(Some((index, modified)));
                    }
                    Verdict::Failed(error) => failures.push(Failure {
                        handler: handler.name().to_string(),
                        key: key.to_string(),
                        error,
                    }),
                }
            }
        }
        Ok(None)
    }
}
