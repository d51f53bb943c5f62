//! Dependency-aware locking
//!
//! Every registry owns a [`WriteLock`]: an exclusive, thread-owned,
//! reentrant try-lock. A transaction on a registry needs that lock plus the
//! locks of every registry it transitively depends on. [`LockCoordinator`]
//! acquires the whole closure without ever blocking while holding part of
//! it:
//!
//! 1. try-lock the registry itself
//! 2. walk the dependencies, try-locking each one at most once per attempt
//! 3. on any failure release everything acquired in this attempt, sleep a
//!    random jitter and start over
//!
//! No thread waits while holding a partial lock set, so the protocol cannot
//! deadlock, including on cyclic and diamond-shaped dependency graphs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::dependency::Upstream;
use crate::error::{RegistryError, Result};

/// Process-unique registry identifier
pub type RegistryId = u64;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh registry id
pub fn next_registry_id() -> RegistryId {
    NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Write lock
// =============================================================================

#[derive(Debug)]
struct Owner {
    thread: ThreadId,
    holds: usize,
}

/// Exclusive, reentrant, non-blocking lock owned by one thread at a time
#[derive(Debug)]
pub struct WriteLock {
    registry: String,
    owner: Mutex<Option<Owner>>,
}

impl WriteLock {
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            owner: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Acquire if free or already owned by the calling thread
    pub fn try_acquire(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        match owner.as_mut() {
            None => {
                *owner = Some(Owner { thread: me, holds: 1 });
                true
            }
            Some(current) if current.thread == me => {
                current.holds += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Drop one hold of the calling thread
    pub fn release(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        match owner.as_mut() {
            Some(current) if current.thread == me => {
                current.holds -= 1;
                if current.holds == 0 {
                    *owner = None;
                }
            }
            _ => warn!(registry = %self.registry, "release of a write lock not held by this thread"),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.owner
            .lock()
            .as_ref()
            .map_or(false, |owner| owner.thread == me)
    }

    /// Locked by a thread other than the caller
    pub fn is_held_elsewhere(&self) -> bool {
        let me = thread::current().id();
        self.owner
            .lock()
            .as_ref()
            .map_or(false, |owner| owner.thread != me)
    }
}

// =============================================================================
// Lock set
// =============================================================================

/// Locks acquired during one attempt, released together
#[derive(Default)]
pub struct LockSet {
    ids: HashSet<RegistryId>,
    locks: Vec<Arc<WriteLock>>,
}

impl LockSet {
    pub fn contains(&self, id: RegistryId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Try-lock `lock` unless `id` is already part of the set
    fn try_add(&mut self, id: RegistryId, lock: Arc<WriteLock>) -> bool {
        if self.ids.contains(&id) {
            return true;
        }
        if !lock.try_acquire() {
            return false;
        }
        self.ids.insert(id);
        self.locks.push(lock);
        true
    }

    /// Release in reverse acquisition order
    pub fn release_all(&mut self) {
        while let Some(lock) = self.locks.pop() {
            lock.release();
        }
        self.ids.clear();
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Try-lock `upstream` and everything it depends on into `set`
fn try_lock_upstream(upstream: &Arc<dyn Upstream>, set: &mut LockSet) -> bool {
    if set.contains(upstream.id()) {
        return true;
    }
    if !set.try_add(upstream.id(), upstream.write_lock()) {
        return false;
    }
    upstream
        .upstreams()
        .iter()
        .all(|next| try_lock_upstream(next, set))
}

// =============================================================================
// Coordinator
// =============================================================================

/// Inclusive jitter range for lock retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Jitter {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn from_millis(min: u64, max: u64) -> Self {
        Self::new(Duration::from_millis(min), Duration::from_millis(max))
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::from_millis(20, 70)
    }
}

#[derive(Default)]
struct Transaction {
    depth: usize,
    held: Option<LockSet>,
}

/// Transitive lock acquisition for one registry
pub struct LockCoordinator {
    id: RegistryId,
    write: Arc<WriteLock>,
    transaction: Mutex<Transaction>,
    jitter: Jitter,
    // Bumped by every interrupt; a retry loop only reacts to bumps made
    // after it started.
    interrupts: AtomicU64,
    shutting_down: AtomicBool,
}

impl LockCoordinator {
    pub fn new(id: RegistryId, registry: impl Into<String>, jitter: Jitter) -> Self {
        Self {
            id,
            write: Arc::new(WriteLock::new(registry)),
            transaction: Mutex::new(Transaction::default()),
            jitter,
            interrupts: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn write_lock(&self) -> Arc<WriteLock> {
        self.write.clone()
    }

    /// Nesting depth of the current transaction, 0 when unlocked
    pub fn depth(&self) -> usize {
        if self.write.is_held_by_current_thread() {
            self.transaction.lock().depth
        } else {
            0
        }
    }

    /// Number of registries locked by the outermost `lock`
    pub fn held_count(&self) -> usize {
        if !self.write.is_held_by_current_thread() {
            return 0;
        }
        self.transaction
            .lock()
            .held
            .as_ref()
            .map_or(0, LockSet::len)
    }

    /// Acquire this registry and every registry in `upstreams`, transitively
    ///
    /// Re-locking on the owning thread only increments the nesting depth.
    /// Retries until success; [`interrupt`](Self::interrupt) breaks the loop
    /// unless a shutdown is in progress.
    pub fn lock(&self, upstreams: &dyn Fn() -> Vec<Arc<dyn Upstream>>) -> Result<()> {
        if self.write.is_held_by_current_thread() {
            let mut tx = self.transaction.lock();
            if tx.depth > 0 {
                tx.depth += 1;
                return Ok(());
            }
        }

        let mut seen = self.interrupts.load(Ordering::SeqCst);
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let mut set = LockSet::default();
            let acquired = set.try_add(self.id, self.write.clone())
                && upstreams()
                    .iter()
                    .all(|upstream| try_lock_upstream(upstream, &mut set));

            if acquired {
                let mut tx = self.transaction.lock();
                tx.depth = 1;
                tx.held = Some(set);
                if attempt > 1 {
                    debug!(registry = %self.write.registry(), attempt, "transitive lock acquired after retries");
                }
                return Ok(());
            }

            set.release_all();
            self.check_interrupt(&mut seen)?;
            thread::sleep(self.jitter.sample());
        }
    }

    /// Leave one nesting level; the outermost level releases the lock set
    pub fn unlock(&self) {
        if !self.write.is_held_by_current_thread() {
            warn!(registry = %self.write.registry(), "unlock without a matching lock");
            return;
        }
        let released = {
            let mut tx = self.transaction.lock();
            if tx.depth == 0 {
                warn!(registry = %self.write.registry(), "unlock without a matching lock");
                return;
            }
            tx.depth -= 1;
            if tx.depth == 0 {
                tx.held.take()
            } else {
                None
            }
        };
        // LockSet releases on drop; done outside the transaction mutex.
        drop(released);
    }

    /// Break the [`lock`](Self::lock) retry loops currently waiting
    ///
    /// Has no effect on lock calls started afterwards.
    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark shutdown; interrupts are swallowed from now on
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn check_interrupt(&self, seen: &mut u64) -> Result<()> {
        let current = self.interrupts.load(Ordering::SeqCst);
        if current == *seen {
            return Ok(());
        }
        *seen = current;
        if self.is_shutting_down() {
            warn!(registry = %self.write.registry(), "interrupt ignored during shutdown");
            return Ok(());
        }
        Err(RegistryError::Interrupted {
            registry: self.write.registry().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_write_lock_is_reentrant_per_thread() {
        let lock = Arc::new(WriteLock::new("units"));
        assert!(lock.try_acquire());
        assert!(lock.try_acquire());

        let other = lock.clone();
        let acquired_elsewhere = thread::spawn(move || other.try_acquire()).join().unwrap();
        assert!(!acquired_elsewhere);

        lock.release();
        assert!(lock.is_held_by_current_thread());
        lock.release();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_set_releases_on_drop() {
        let a = Arc::new(WriteLock::new("a"));
        let b = Arc::new(WriteLock::new("b"));
        {
            let mut set = LockSet::default();
            assert!(set.try_add(1, a.clone()));
            assert!(set.try_add(2, b.clone()));
            assert!(set.try_add(1, a.clone()));
            assert_eq!(set.len(), 2);
        }
        assert!(!a.is_locked());
        assert!(!b.is_locked());
    }

    #[test]
    fn test_coordinator_nesting() {
        let coordinator = LockCoordinator::new(next_registry_id(), "units", Jitter::default());
        let none = || -> Vec<Arc<dyn Upstream>> { Vec::new() };
        coordinator.lock(&none).unwrap();
        coordinator.lock(&none).unwrap();
        assert_eq!(coordinator.depth(), 2);
        coordinator.unlock();
        assert!(coordinator.write_lock().is_locked());
        coordinator.unlock();
        assert!(!coordinator.write_lock().is_locked());
    }

    #[test]
    fn test_interrupt_breaks_retry_loop() {
        let coordinator = Arc::new(LockCoordinator::new(
            next_registry_id(),
            "units",
            Jitter::from_millis(1, 2),
        ));
        let write = coordinator.write_lock();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            assert!(write.try_acquire());
            locked_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            write.release();
        });
        locked_rx.recv().unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            thread::spawn(move || coordinator.lock(&|| Vec::new()))
        };
        thread::sleep(Duration::from_millis(20));
        coordinator.interrupt();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(RegistryError::Interrupted { .. })));
        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_interrupt_swallowed_during_shutdown() {
        let coordinator = Arc::new(LockCoordinator::new(
            next_registry_id(),
            "units",
            Jitter::from_millis(1, 2),
        ));
        let write = coordinator.write_lock();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            assert!(write.try_acquire());
            locked_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            write.release();
        });
        locked_rx.recv().unwrap();

        coordinator.begin_shutdown();
        let waiter = {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                let result = coordinator.lock(&|| Vec::new());
                coordinator.unlock();
                result
            })
        };
        thread::sleep(Duration::from_millis(20));
        coordinator.interrupt();
        thread::sleep(Duration::from_millis(20));
        done_tx.send(()).unwrap();

        let started = Instant::now();
        assert!(waiter.join().unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        holder.join().unwrap();
    }

    #[test]
    fn test_interrupt_before_lock_is_not_remembered() {
        let coordinator = Arc::new(LockCoordinator::new(
            next_registry_id(),
            "units",
            Jitter::from_millis(1, 2),
        ));
        coordinator.interrupt();

        let write = coordinator.write_lock();
        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = thread::spawn(move || {
            assert!(write.try_acquire());
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(30));
            write.release();
        });
        locked_rx.recv().unwrap();

        coordinator.lock(&|| Vec::new()).unwrap();
        assert_eq!(coordinator.depth(), 1);
        coordinator.unlock();
        holder.join().unwrap();
    }

    #[test]
    fn test_jitter_range_is_normalised() {
        let jitter = Jitter::from_millis(70, 20);
        for _ in 0..32 {
            let sample = jitter.sample();
            assert!(sample >= Duration::from_millis(20));
            assert!(sample <= Duration::from_millis(70));
        }
    }
}
