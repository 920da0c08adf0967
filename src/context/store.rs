// src/context/store.rs
//! Execution context store
//!
//! Holds the active `Configuration` per thread, with a process-wide fallback
//! for threads spawned by code under test and a generation counter that
//! invalidates copies left behind on pooled threads.
//!
//! # Layout
//!
//! ```text
//! ContextStore
//! ├─ generation: AtomicU64           (bumped by every clear)
//! ├─ fallback:   RwLock<Option<Arc>> (last activated configuration)
//! └─ per-thread slot                 (thread-local, keyed by store id)
//!
//! get_configuration():
//!   slot.generation == generation  → slot
//!   harness infrastructure thread  → none
//!   otherwise                      → fallback
//! ```
//!
//! # Write precondition
//!
//! `set_configuration` / `clear_configuration` are driven by one lifecycle
//! adapter running one test at a time against a given store. Readers may be
//! any number of threads. Running several tests concurrently against the
//! same store needs a different design (configurations keyed by test id).

use crate::context::thread_identity::{NoHarnessThreads, ThreadClassifier, ThreadNamePrefixes};
use crate::policy::configuration::Configuration;
use crate::utils::config::AirgapConfig;
use dashmap::DashSet;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Ids of stores not yet dropped. Slot writes prune entries of other ids.
static LIVE_STORES: Lazy<DashSet<u64>> = Lazy::new(DashSet::new);

static GLOBAL_STORE: Lazy<Arc<ContextStore>> = Lazy::new(|| {
    let prefixes = &AirgapConfig::global().engine.harness_thread_prefixes;
    let store = if prefixes.is_empty() {
        ContextStore::new()
    } else {
        ContextStore::with_classifier(Arc::new(ThreadNamePrefixes::new(prefixes.iter().cloned())))
    };
    Arc::new(store)
});

thread_local! {
    /// Active configuration of this thread, one entry per store
    static SLOTS: RefCell<Vec<(u64, Arc<Configuration>)>> = const { RefCell::new(Vec::new()) };
}

/// Per-thread configuration holder with generation-based invalidation
pub struct ContextStore {
    /// Key for this store's thread-local slots
    id: u64,

    /// Incremented on every clear; slots from older generations are stale
    generation: AtomicU64,

    /// Configuration served to threads without a current slot
    fallback: RwLock<Option<Arc<Configuration>>>,

    /// Identifies threads that must never use the fallback
    classifier: Arc<dyn ThreadClassifier>,
}

impl ContextStore {
    /// Create a store that treats every thread as a test thread
    pub fn new() -> Self {
        Self::with_classifier(Arc::new(NoHarnessThreads))
    }

    /// Create a store with a harness-thread classifier
    pub fn with_classifier(classifier: Arc<dyn ThreadClassifier>) -> Self {
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_STORES.insert(id);
        Self {
            id,
            generation: AtomicU64::new(0),
            fallback: RwLock::new(None),
            classifier,
        }
    }

    /// Process-wide store used by the interception layers
    pub fn global() -> Arc<ContextStore> {
        Arc::clone(&GLOBAL_STORE)
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Activate `config` for the calling thread and as the process-wide fallback
    pub fn set_configuration(&self, mut config: Configuration) -> Arc<Configuration> {
        config.generation = self.generation.load(Ordering::SeqCst);
        let config = Arc::new(config);

        self.store_local(Arc::clone(&config));
        *self.fallback.write() = Some(Arc::clone(&config));

        debug!(
            generation = config.generation,
            allowed = config.allowed_patterns().len(),
            blocked = config.blocked_patterns().len(),
            "Configuration activated"
        );
        config
    }

    /// Deactivate the calling thread's configuration and invalidate every copy
    pub fn clear_configuration(&self) {
        let id = self.id;
        let _ = SLOTS.try_with(|slots| slots.borrow_mut().retain(|(store, _)| *store != id));
        *self.fallback.write() = None;
        let previous = self.generation.fetch_add(1, Ordering::SeqCst);

        debug!(generation = previous + 1, "Configuration cleared");
    }

    /// Configuration applying to the calling thread, if any
    pub fn get_configuration(&self) -> Option<Arc<Configuration>> {
        let current = self.generation.load(Ordering::SeqCst);

        if let Some(local) = self.local() {
            if local.generation == current {
                return Some(local);
            }
            // stale copy from an earlier test; drop it from this thread
            self.drop_stale_local(current);
        }

        if self.classifier.is_harness_infrastructure(&thread::current()) {
            return None;
        }

        self.fallback.read().clone()
    }

    pub fn has_active_configuration(&self) -> bool {
        self.get_configuration().is_some()
    }

    /// Capture the calling thread's view for hand-off to another thread
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            store_id: self.id,
            config: self.get_configuration(),
        }
    }

    /// Spawn a thread that starts with the caller's configuration attached
    pub fn spawn_inheriting<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let snapshot = self.snapshot();
        thread::spawn(move || {
            snapshot.attach();
            f()
        })
    }

    fn local(&self) -> Option<Arc<Configuration>> {
        let id = self.id;
        SLOTS
            .try_with(|slots| {
                slots
                    .borrow()
                    .iter()
                    .find(|(store, _)| *store == id)
                    .map(|(_, config)| Arc::clone(config))
            })
            .ok()
            .flatten()
    }

    fn store_local(&self, config: Arc<Configuration>) {
        store_slot(self.id, config);
    }

    fn drop_stale_local(&self, current: u64) {
        let id = self.id;
        let _ = SLOTS.try_with(|slots| {
            slots
                .borrow_mut()
                .retain(|(store, config)| *store != id || config.generation == current)
        });
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

// Releases the dropping thread's slot now. Slots on other threads go on their
// next slot write, or when the thread exits.
impl Drop for ContextStore {
    fn drop(&mut self) {
        LIVE_STORES.remove(&self.id);
        let id = self.id;
        let _ = SLOTS.try_with(|slots| slots.borrow_mut().retain(|(store, _)| *store != id));
    }
}

/// A thread's configuration captured for another thread
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    store_id: u64,
    config: Option<Arc<Configuration>>,
}

impl ContextSnapshot {
    /// Install the captured configuration as the calling thread's slot.
    ///
    /// The attached copy obeys the same generation rule as any other slot:
    /// once the originating test clears, it stops applying.
    pub fn attach(&self) {
        if let Some(config) = &self.config {
            store_slot(self.store_id, Arc::clone(config));
        }
    }

    pub fn configuration(&self) -> Option<&Arc<Configuration>> {
        self.config.as_ref()
    }
}

fn store_slot(store_id: u64, config: Arc<Configuration>) {
    if !LIVE_STORES.contains(&store_id) {
        return;
    }
    let _ = SLOTS.try_with(|slots| {
        let mut slots = slots.borrow_mut();
        slots.retain(|(store, _)| LIVE_STORES.contains(store));
        match slots.iter_mut().find(|(store, _)| *store == store_id) {
            Some(slot) => slot.1 = config,
            None => slots.push((store_id, config)),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn allow_localhost() -> Configuration {
        Configuration::builder().allow("localhost").build().unwrap()
    }

    fn allow_example() -> Configuration {
        Configuration::builder().allow("example.com").build().unwrap()
    }

    #[test]
    fn test_empty_store() {
        let store = ContextStore::new();
        assert!(store.get_configuration().is_none());
        assert!(!store.has_active_configuration());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn test_set_assigns_generation() {
        let store = ContextStore::new();
        store.clear_configuration();
        store.clear_configuration();

        let active = store.set_configuration(allow_localhost());
        assert_eq!(active.generation(), 2);
        assert_eq!(store.get_configuration().unwrap().generation(), 2);
    }

    #[test]
    fn test_clear_bumps_generation_and_empties() {
        let store = ContextStore::new();
        store.set_configuration(allow_localhost());
        store.clear_configuration();

        assert_eq!(store.generation(), 1);
        assert!(store.get_configuration().is_none());
    }

    #[test]
    fn test_spawned_thread_sees_fallback() {
        let store = Arc::new(ContextStore::new());
        store.set_configuration(allow_localhost());

        let worker_store = Arc::clone(&store);
        let seen = thread::spawn(move || worker_store.get_configuration())
            .join()
            .unwrap();

        assert!(seen.unwrap().is_allowed("localhost"));
    }

    #[test]
    fn test_harness_thread_ignores_fallback() {
        let classifier = Arc::new(ThreadNamePrefixes::new(["harness-"]));
        let store = Arc::new(ContextStore::with_classifier(classifier));
        store.set_configuration(allow_localhost());

        let worker_store = Arc::clone(&store);
        let seen = thread::Builder::new()
            .name("harness-resolver".to_string())
            .spawn(move || worker_store.get_configuration())
            .unwrap()
            .join()
            .unwrap();
        assert!(seen.is_none());
    }

    #[test]
    fn test_harness_thread_keeps_explicit_snapshot() {
        let classifier = Arc::new(ThreadNamePrefixes::new(["harness-"]));
        let store = Arc::new(ContextStore::with_classifier(classifier));
        store.set_configuration(allow_localhost());
        let snapshot = store.snapshot();

        let worker_store = Arc::clone(&store);
        let seen = thread::Builder::new()
            .name("harness-resolver".to_string())
            .spawn(move || {
                snapshot.attach();
                worker_store.get_configuration()
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(seen.is_some());
    }

    #[test]
    fn test_pooled_thread_does_not_leak_stale_configuration() {
        let store = Arc::new(ContextStore::new());
        store.set_configuration(allow_localhost());

        // a pooled worker picks up the first test's configuration
        let (job_tx, job_rx) = mpsc::channel::<mpsc::Sender<Option<Arc<Configuration>>>>();
        let snapshot = store.snapshot();
        let worker_store = Arc::clone(&store);
        let worker = thread::spawn(move || {
            snapshot.attach();
            for reply in job_rx {
                reply.send(worker_store.get_configuration()).unwrap();
            }
        });

        let ask = || {
            let (tx, rx) = mpsc::channel();
            job_tx.send(tx).unwrap();
            rx.recv().unwrap()
        };

        assert!(ask().unwrap().is_allowed("localhost"));

        // first test ends: the worker's copy is stale
        store.clear_configuration();
        assert!(ask().is_none());

        // second, unrelated test: the worker follows it, not the stale copy
        store.set_configuration(allow_example());
        let seen = ask().unwrap();
        assert!(seen.is_allowed("example.com"));
        assert!(!seen.is_allowed("localhost"));

        drop(job_tx);
        worker.join().unwrap();
    }

    #[test]
    fn test_spawn_inheriting() {
        let store = Arc::new(ContextStore::new());
        store.set_configuration(allow_localhost());

        let child_store = Arc::clone(&store);
        let seen = store
            .spawn_inheriting(move || child_store.local().map(|c| c.generation()))
            .join()
            .unwrap();
        assert_eq!(seen, Some(0));
    }

    #[test]
    fn test_stores_are_independent() {
        let a = ContextStore::new();
        let b = ContextStore::new();

        a.set_configuration(allow_localhost());
        assert!(a.has_active_configuration());
        assert!(!b.has_active_configuration());

        b.set_configuration(allow_example());
        a.clear_configuration();
        assert!(!a.has_active_configuration());
        assert!(b.get_configuration().unwrap().is_allowed("example.com"));
    }

    fn has_slot(store_id: u64) -> bool {
        SLOTS.with(|slots| slots.borrow().iter().any(|(store, _)| *store == store_id))
    }

    #[test]
    fn test_dropped_store_releases_slots() {
        let kept = Arc::new(ContextStore::new());
        let dropped = ContextStore::new();
        let dropped_id = dropped.id;
        dropped.set_configuration(allow_localhost());
        assert!(has_slot(dropped_id));

        let snapshot = dropped.snapshot();
        let (attached_tx, attached_rx) = mpsc::channel();
        let (dropped_tx, dropped_rx) = mpsc::channel::<()>();
        let worker_store = Arc::clone(&kept);
        let worker = thread::spawn(move || {
            snapshot.attach();
            attached_tx.send(has_slot(dropped_id)).unwrap();
            dropped_rx.recv().unwrap();
            worker_store.set_configuration(allow_example());
            has_slot(dropped_id)
        });

        assert!(attached_rx.recv().unwrap());
        let late_snapshot = dropped.snapshot();
        drop(dropped);
        assert!(!has_slot(dropped_id));

        // the worker's slot goes on its next write
        dropped_tx.send(()).unwrap();
        assert!(!worker.join().unwrap());

        // attaching a snapshot of a dropped store is a no-op
        late_snapshot.attach();
        assert!(!has_slot(dropped_id));
    }

    #[test]
    fn test_concurrent_readers_observe_clear() {
        let store = Arc::new(ContextStore::new());
        store.set_configuration(allow_localhost());

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        if let Some(config) = store.get_configuration() {
                            assert!(config.is_allowed("localhost"));
                        }
                    }
                })
            })
            .collect();

        store.clear_configuration();
        for reader in readers {
            reader.join().unwrap();
        }
        assert!(store.get_configuration().is_none());
    }
}
