//! Diff-based synchronization
//!
//! A [`Synchronizer`] mirrors an externally owned snapshot into a local
//! registry. Each run diffs the last applied state against the current
//! snapshot and applies removals, updates and registrations in that order.
//! Every phase is fault isolated: one failing entry never blocks the rest.
//!
//! Triggers are rate limited. A trigger inside the minimum interval schedules
//! one deferred run; further triggers before that run are coalesced into it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::entry::{Entry, EntryMap};
use crate::error::{MultiError, RegistryError, Result};
use crate::hooks::ObserverId;
use crate::registry::Registry;

// =============================================================================
// Collaborators
// =============================================================================

/// Change callback registered on a [`DataProvider`]
pub type ProviderObserver = Arc<dyn Fn() + Send + Sync>;

/// Authoritative, pollable source of entries
///
/// The transport behind it (network, file) is the provider's business.
pub trait DataProvider<E: Entry>: Send + Sync {
    fn is_available(&self) -> bool;
    fn snapshot(&self) -> Result<Vec<E>>;
    fn add_observer(&self, observer: ProviderObserver) -> ObserverId;
    fn remove_observer(&self, id: ObserverId);
}

/// Predicate excluding snapshot entries from the mirror
pub trait SyncFilter<E>: Send + Sync {
    fn excludes(&self, entry: &E) -> bool;
}

impl<E, F> SyncFilter<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn excludes(&self, entry: &E) -> bool {
        self(entry)
    }
}

/// Per-run information handed to [`SyncActions`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncContext {
    /// First run of this synchronizer
    pub initial: bool,
}

/// How a diff is applied to the registry
///
/// The defaults write straight through; override to special-case the
/// bootstrap run or to translate entries.
#[allow(unused_variables)]
pub trait SyncActions<E: Entry>: Send + Sync {
    fn remove(&self, registry: &Registry<E>, entry: &E, ctx: &SyncContext) -> Result<()> {
        registry.remove(&entry.key()).map(|_| ())
    }

    fn update(&self, registry: &Registry<E>, entry: &E, ctx: &SyncContext) -> Result<()> {
        registry.update(entry.clone()).map(|_| ())
    }

    fn register(&self, registry: &Registry<E>, entry: &E, ctx: &SyncContext) -> Result<()> {
        registry.register(entry.clone()).map(|_| ())
    }
}

/// Default [`SyncActions`]: plain register / update / remove
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectActions;

impl<E: Entry> SyncActions<E> for DirectActions {}

// =============================================================================
// Rate limiter
// =============================================================================

/// Decision of [`RateLimiter::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run now
    Now,
    /// Run once after the delay
    Deferred(Duration),
    /// A deferred run is already pending and will cover this trigger
    Coalesced,
}

#[derive(Debug, Default)]
struct LimiterState {
    last_run: Option<Instant>,
    pending: bool,
}

/// At most one run per `min_interval`
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        if state.pending {
            return Admission::Coalesced;
        }
        let now = Instant::now();
        match state.last_run {
            Some(last) if now.duration_since(last) < self.min_interval => {
                state.pending = true;
                Admission::Deferred(self.min_interval - now.duration_since(last))
            }
            _ => {
                state.last_run = Some(now);
                Admission::Now
            }
        }
    }

    /// Record a run started outside `admit`, clearing any pending deferral
    pub fn record_run(&self) {
        let mut state = self.state.lock();
        state.last_run = Some(Instant::now());
        state.pending = false;
    }
}

// =============================================================================
// Report
// =============================================================================

/// Outcome of one sync run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub initial: bool,
    /// Provider was unavailable; nothing was diffed
    pub skipped: bool,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub registered: Vec<String>,
    /// New snapshot entries rejected by the filter
    pub excluded: Vec<String>,
    pub failures: usize,
    pub completed_at: DateTime<Utc>,
}

impl SyncReport {
    fn new(initial: bool) -> Self {
        Self {
            initial,
            skipped: false,
            removed: Vec::new(),
            updated: Vec::new(),
            registered: Vec::new(),
            excluded: Vec::new(),
            failures: 0,
            completed_at: Utc::now(),
        }
    }

    /// Operations actually applied
    pub fn operations(&self) -> usize {
        self.removed.len() + self.updated.len() + self.registered.len()
    }
}

// =============================================================================
// Diff
// =============================================================================

/// Changes between the last applied state and a new snapshot
#[derive(Debug)]
pub struct SyncPlan<E> {
    pub removed: Vec<E>,
    pub updated: Vec<E>,
    pub added: Vec<E>,
    pub excluded: Vec<E>,
}

/// Diff `known` against `snapshot`
///
/// Known entries that are missing or now excluded are removed; new entries
/// that are excluded are skipped. Every list is sorted by key.
pub fn plan_sync<E: Entry>(
    known: &EntryMap<E>,
    snapshot: Vec<E>,
    filter: Option<&dyn SyncFilter<E>>,
) -> SyncPlan<E> {
    let excludes = |entry: &E| filter.map_or(false, |f| f.excludes(entry));
    let incoming: HashMap<E::Key, E> = snapshot.into_iter().map(|e| (e.key(), e)).collect();

    let mut plan = SyncPlan {
        removed: Vec::new(),
        updated: Vec::new(),
        added: Vec::new(),
        excluded: Vec::new(),
    };

    for (key, old) in known {
        match incoming.get(key) {
            None => plan.removed.push(old.clone()),
            Some(new) if excludes(new) => plan.removed.push(old.clone()),
            Some(new) if new != old => plan.updated.push(new.clone()),
            Some(_) => {}
        }
    }
    for (key, new) in incoming {
        if known.contains_key(&key) {
            continue;
        }
        if excludes(&new) {
            plan.excluded.push(new);
        } else {
            plan.added.push(new);
        }
    }

    for list in [
        &mut plan.removed,
        &mut plan.updated,
        &mut plan.added,
        &mut plan.excluded,
    ] {
        list.sort_by_key(|entry| entry.key());
    }
    plan
}

// =============================================================================
// Synchronizer
// =============================================================================

struct SyncState<E: Entry> {
    last_known: EntryMap<E>,
    initial: bool,
}

/// Builder for [`Synchronizer`]
pub struct SynchronizerBuilder<E: Entry> {
    registry: Arc<Registry<E>>,
    provider: Arc<dyn DataProvider<E>>,
    actions: Arc<dyn SyncActions<E>>,
    filter: Option<Arc<dyn SyncFilter<E>>>,
    min_interval: Duration,
}

impl<E: Entry> SynchronizerBuilder<E> {
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.min_interval = config.sync_interval();
        self
    }

    pub fn min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn actions(mut self, actions: Arc<dyn SyncActions<E>>) -> Self {
        self.actions = actions;
        self
    }

    pub fn filter(mut self, filter: impl SyncFilter<E> + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn build(self) -> Arc<Synchronizer<E>> {
        Arc::new_cyclic(|self_ref| Synchronizer {
            self_ref: self_ref.clone(),
            registry: self.registry,
            provider: self.provider,
            actions: self.actions,
            filter: self.filter,
            limiter: RateLimiter::new(self.min_interval),
            state: Mutex::new(SyncState {
                last_known: EntryMap::<E>::new(),
                initial: true,
            }),
            last_report: Mutex::new(None),
            subscription: Mutex::new(None),
        })
    }
}

/// Mirrors a [`DataProvider`] into a registry
pub struct Synchronizer<E: Entry> {
    self_ref: Weak<Synchronizer<E>>,
    registry: Arc<Registry<E>>,
    provider: Arc<dyn DataProvider<E>>,
    actions: Arc<dyn SyncActions<E>>,
    filter: Option<Arc<dyn SyncFilter<E>>>,
    limiter: RateLimiter,
    state: Mutex<SyncState<E>>,
    last_report: Mutex<Option<SyncReport>>,
    subscription: Mutex<Option<ObserverId>>,
}

impl<E: Entry> Synchronizer<E> {
    pub fn builder(
        registry: Arc<Registry<E>>,
        provider: Arc<dyn DataProvider<E>>,
    ) -> SynchronizerBuilder<E> {
        SynchronizerBuilder {
            registry,
            provider,
            actions: Arc::new(DirectActions),
            filter: None,
            min_interval: EngineConfig::default().sync_interval(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<E>> {
        &self.registry
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Subscribe to provider changes and run the initial sync
    pub fn activate(&self) -> Result<SyncReport> {
        {
            let mut subscription = self.subscription.lock();
            if subscription.is_some() {
                return Err(RegistryError::InvalidState(format!(
                    "synchronizer of {} is already active",
                    self.registry.name()
                )));
            }
            let weak = self.self_ref.clone();
            let id = self.provider.add_observer(Arc::new(move || {
                if let Some(sync) = weak.upgrade() {
                    if let Err(err) = sync.trigger() {
                        warn!(registry = %sync.registry.name(), error = %err, "triggered sync failed");
                    }
                }
            }));
            *subscription = Some(id);
        }

        self.limiter.record_run();
        self.sync()
    }

    /// Stop reacting to provider changes
    pub fn deactivate(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.provider.remove_observer(id);
        }
    }

    /// Rate-limited sync
    ///
    /// Returns the report when the sync ran right away, `None` when it was
    /// deferred or coalesced into a pending run.
    pub fn trigger(&self) -> Result<Option<SyncReport>> {
        match self.limiter.admit() {
            Admission::Now => self.sync().map(Some),
            Admission::Deferred(delay) => {
                let weak = self.self_ref.clone();
                thread::Builder::new()
                    .name(format!("sync-{}", self.registry.name()))
                    .spawn(move || {
                        thread::sleep(delay);
                        if let Some(sync) = weak.upgrade() {
                            sync.limiter.record_run();
                            if let Err(err) = sync.sync() {
                                warn!(registry = %sync.registry.name(), error = %err, "deferred sync failed");
                            }
                        }
                    })
                    .map_err(|e| {
                        RegistryError::InvalidState(format!("cannot schedule deferred sync: {}", e))
                    })?;
                debug!(registry = %self.registry.name(), delay_ms = delay.as_millis() as u64, "sync deferred");
                Ok(None)
            }
            Admission::Coalesced => {
                debug!(registry = %self.registry.name(), "sync trigger coalesced");
                Ok(None)
            }
        }
    }

    /// Run one sync immediately, bypassing the rate limiter
    pub fn sync(&self) -> Result<SyncReport> {
        let mut state = self.state.lock();
        let mut report = SyncReport::new(state.initial);

        if !self.provider.is_available() {
            debug!(registry = %self.registry.name(), "data provider unavailable; sync skipped");
            report.skipped = true;
            *self.last_report.lock() = Some(report.clone());
            return Ok(report);
        }

        let snapshot = self.provider.snapshot()?;
        if state.initial {
            // Entries present before the first run count as applied.
            state.last_known = self
                .registry
                .entries()
                .into_iter()
                .map(|entry| (entry.key(), entry))
                .collect();
        }
        let plan = plan_sync(&state.last_known, snapshot, self.filter.as_deref());
        let ctx = SyncContext {
            initial: state.initial,
        };

        let mut applied = state.last_known.clone();
        let mut failures = Vec::new();

        for entry in &plan.removed {
            match self.actions.remove(&self.registry, entry, &ctx) {
                Ok(()) => {
                    applied.remove(&entry.key());
                    report.removed.push(entry.key().to_string());
                }
                Err(RegistryError::NotAvailable { .. }) if !self.registry.contains_key(&entry.key()) => {
                    debug!(registry = %self.registry.name(), key = %entry.key(), "entry already gone locally");
                    applied.remove(&entry.key());
                }
                Err(err) => failures.push(err),
            }
        }
        for entry in plan.updated {
            match self.actions.update(&self.registry, &entry, &ctx) {
                Ok(()) => {
                    report.updated.push(entry.key().to_string());
                    applied.insert(entry.key(), entry);
                }
                Err(err) => failures.push(err),
            }
        }
        for entry in plan.added {
            match self.actions.register(&self.registry, &entry, &ctx) {
                Ok(()) => {
                    report.registered.push(entry.key().to_string());
                    applied.insert(entry.key(), entry);
                }
                Err(err) => failures.push(err),
            }
        }
        report.excluded = plan.excluded.iter().map(|e| e.key().to_string()).collect();

        state.last_known = applied;
        state.initial = false;
        drop(state);

        report.failures = failures.len();
        report.completed_at = Utc::now();
        info!(
            registry = %self.registry.name(),
            initial = report.initial,
            removed = report.removed.len(),
            updated = report.updated.len(),
            registered = report.registered.len(),
            failures = report.failures,
            "sync finished"
        );
        *self.last_report.lock() = Some(report.clone());

        if failures.is_empty() {
            Ok(report)
        } else {
            let message = format!(
                "sync of {} failed for {} entr{}",
                self.registry.name(),
                failures.len(),
                if failures.len() == 1 { "y" } else { "ies" }
            );
            Err(MultiError::new(message, failures).into())
        }
    }
}
