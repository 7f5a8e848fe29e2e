//! Process-wide in-memory cache of session namespaces.
//!
//! Each session owns a slot guarded by an async mutex; every
//! read-modify-write on a session (upload merge, cold reconstruction)
//! happens while holding that slot's lock, so operations on one session are
//! serialised without a global lock. A warm slot holds an immutable
//! [`Namespace`] snapshot; writers publish a replacement and readers keep
//! whatever snapshot they obtained.
//!
//! A cold slot holds nothing. Eviction (idle TTL, then an LRU bound on warm
//! slots) only ever turns warm slots cold; durable state is untouched and
//! the next access reconstructs.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::CacheConfig;
use crate::namespace::Namespace;

/// State of one session slot.
#[derive(Debug)]
pub struct SlotState {
    namespace: Option<Arc<Namespace>>,
    last_used: Instant,
}

impl SlotState {
    fn cold() -> Self {
        Self {
            namespace: None,
            last_used: Instant::now(),
        }
    }

    pub fn is_warm(&self) -> bool {
        self.namespace.is_some()
    }

    /// Current snapshot, `None` while cold.
    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        self.namespace.clone()
    }

    /// Replace the snapshot and return the published copy.
    pub fn publish(&mut self, namespace: Namespace) -> Arc<Namespace> {
        let snapshot = Arc::new(namespace);
        self.namespace = Some(snapshot.clone());
        self.last_used = Instant::now();
        snapshot
    }

    pub fn clear(&mut self) {
        self.namespace = None;
    }
}

/// Exclusive access to one session slot.
pub type SlotGuard = OwnedMutexGuard<SlotState>;

pub struct SessionCache {
    slots: DashMap<String, Arc<Mutex<SlotState>>>,
    max_sessions: usize,
    idle_ttl: Duration,
    reconstructions: AtomicU64,
}

impl SessionCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            slots: DashMap::new(),
            max_sessions: config.max_sessions.max(1),
            idle_ttl: config.idle_ttl(),
            reconstructions: AtomicU64::new(0),
        }
    }

    fn slot(&self, session_id: &str) -> Arc<Mutex<SlotState>> {
        let entry = self
            .slots
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SlotState::cold())));
        Arc::clone(entry.value())
    }

    /// Lock a session's slot, creating a cold one if needed.
    pub async fn lock(&self, session_id: &str) -> SlotGuard {
        let slot = self.slot(session_id);
        let mut guard = slot.lock_owned().await;
        guard.last_used = Instant::now();
        guard
    }

    /// Install an empty warm namespace for a freshly created session.
    pub async fn insert_empty(&self, session_id: &str) -> Arc<Namespace> {
        let mut guard = self.lock(session_id).await;
        guard.publish(Namespace::new())
    }

    pub fn is_warm(&self, session_id: &str) -> bool {
        let slot = match self.slots.get(session_id) {
            Some(s) => Arc::clone(s.value()),
            None => return false,
        };
        let warm = match slot.try_lock() {
            Ok(state) => state.is_warm(),
            // A locked slot is being worked on; report what we cannot see
            // as cold.
            Err(_) => false,
        };
        warm
    }

    /// Force a session back to cold.
    pub async fn invalidate(&self, session_id: &str) {
        let slot = match self.slots.get(session_id) {
            Some(s) => Arc::clone(s.value()),
            None => return,
        };
        slot.lock().await.clear();
    }

    /// Force every session back to cold, as after a process restart.
    pub async fn invalidate_all(&self) {
        let slots: Vec<Arc<Mutex<SlotState>>> =
            self.slots.iter().map(|e| Arc::clone(e.value())).collect();
        for slot in slots {
            slot.lock().await.clear();
        }
    }

    /// Drop a session's slot entirely (the session no longer exists).
    pub fn forget(&self, session_id: &str) {
        self.slots.remove(session_id);
    }

    pub fn note_reconstruction(&self) {
        self.reconstructions.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of cold-cache reconstructions performed so far.
    pub fn reconstructions(&self) -> u64 {
        self.reconstructions.load(Ordering::Relaxed)
    }

    /// Slots currently tracked, warm or cold.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn warm_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| e.value().try_lock().map(|s| s.is_warm()).unwrap_or(true))
            .count()
    }

    /// Apply the idle TTL and the LRU bound. Locked slots are skipped.
    /// Returns how many sessions went cold.
    pub fn evict(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;

        let slots: Vec<(String, Arc<Mutex<SlotState>>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut warm: Vec<(Instant, Arc<Mutex<SlotState>>)> = Vec::new();
        for (_, slot) in &slots {
            if let Ok(mut state) = slot.try_lock() {
                if !state.is_warm() {
                    continue;
                }
                if now.duration_since(state.last_used) >= self.idle_ttl {
                    state.clear();
                    evicted += 1;
                } else {
                    warm.push((state.last_used, Arc::clone(slot)));
                }
            }
        }

        if warm.len() > self.max_sessions {
            warm.sort_by_key(|(used, _)| *used);
            let excess = warm.len() - self.max_sessions;
            for (_, slot) in warm.into_iter().take(excess) {
                if let Ok(mut state) = slot.try_lock() {
                    state.clear();
                    evicted += 1;
                }
            }
        }
        drop(slots);

        // Cold slots nobody holds carry no information; drop them.
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.try_lock().map(|s| s.is_warm()).unwrap_or(true)
        });

        if evicted > 0 {
            tracing::debug!(evicted, slots = self.slot_count(), "Evicted idle sessions from cache");
        }
        evicted
    }
}
