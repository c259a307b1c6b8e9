//! Per-key concurrency limiting
//!
//! What this module provides
//! - `Limiter`: at most `n` concurrent executions; extra callers wait in strict FIFO order
//! - `LimiterRegistry`: lazily creates one limiter per `(concurrency_key, user_id)` pair
//!
//! Implementation strategy
//! - Backed by `tokio::sync::Semaphore`, which hands out permits in request order, so
//!   queued work runs in submission order regardless of caller priority
//! - Active/queued counters are maintained with drop guards so a caller that gives up
//!   while queued (e.g. its future is dropped) never leaks a count
//! - The registry is bounded: once `max_limiters` instances exist, the least recently
//!   used *idle* limiter is evicted before a new one is created
//!
//! Testing strategy
//! - Atomic high-water mark across many tasks bounds observed concurrency by `n`
//! - A one-slot limiter with three queued tasks completes them in submission order

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::ConcurrencyConfig;
use crate::error::{GuardError, Result};

/// Bounds simultaneous executions of one class of work.
#[derive(Debug)]
pub struct Limiter {
    key: String,
    limit: usize,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

/// Slot held while work runs. Dropping it frees the slot for the next queued caller.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct QueuedGuard(Arc<AtomicUsize>);

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Limiter {
    pub fn new(limit: usize) -> Self {
        Self::with_key("default", limit)
    }

    pub fn with_key(key: impl Into<String>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            key: key.into(),
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// No running and no waiting work.
    pub fn is_idle(&self) -> bool {
        self.active() == 0 && self.queued() == 0
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<LimiterPermit> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let waiting = QueuedGuard(self.queued.clone());
        let permit = self.semaphore.clone().acquire_owned().await;
        drop(waiting);

        let permit = permit.map_err(|_| GuardError::LimiterClosed {
            key: self.key.clone(),
        })?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(LimiterPermit {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    /// Run `f` once a slot is free and resolve with its output.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await?;
        Ok(f().await)
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            concurrency_key: self.key.clone(),
            user_id: None,
            limit: self.limit,
            active: self.active(),
            queued: self.queued(),
        }
    }
}

/// Registry key: a class of work scoped to one user (or to anonymous callers).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    pub concurrency_key: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterStats {
    pub concurrency_key: String,
    pub user_id: Option<String>,
    pub limit: usize,
    pub active: usize,
    pub queued: usize,
}

struct Entry {
    limiter: Arc<Limiter>,
    last_used: u64,
}

#[derive(Default)]
struct RegistryInner {
    limiters: HashMap<LimiterKey, Entry>,
    tick: u64,
}

/// Lazily created limiters keyed by `(concurrency_key, user_id)`.
pub struct LimiterRegistry {
    config: ConcurrencyConfig,
    inner: Mutex<RegistryInner>,
}

impl LimiterRegistry {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Limiter for `concurrency_key` scoped to `user_id`, created on first use.
    pub fn limiter(&self, concurrency_key: &str, user_id: Option<&str>) -> Arc<Limiter> {
        let key = LimiterKey {
            concurrency_key: concurrency_key.to_string(),
            user_id: user_id.map(str::to_string),
        };

        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.limiters.get_mut(&key) {
            entry.last_used = tick;
            return entry.limiter.clone();
        }

        if inner.limiters.len() >= self.config.max_limiters.max(1) {
            evict_lru_idle(&mut inner.limiters);
        }

        let limiter = Arc::new(Limiter::with_key(
            concurrency_key,
            self.config.limit_for(concurrency_key),
        ));
        debug!(
            concurrency_key,
            user_id = user_id.unwrap_or("-"),
            limit = limiter.limit(),
            "created limiter"
        );
        inner.limiters.insert(
            key,
            Entry {
                limiter: limiter.clone(),
                last_used: tick,
            },
        );
        limiter
    }

    pub fn len(&self) -> usize {
        self.lock().limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<LimiterStats> {
        let inner = self.lock();
        let mut stats: Vec<LimiterStats> = inner
            .limiters
            .iter()
            .map(|(key, entry)| LimiterStats {
                concurrency_key: key.concurrency_key.clone(),
                user_id: key.user_id.clone(),
                limit: entry.limiter.limit(),
                active: entry.limiter.active(),
                queued: entry.limiter.queued(),
            })
            .collect();
        stats.sort_by(|a, b| {
            (&a.concurrency_key, &a.user_id).cmp(&(&b.concurrency_key, &b.user_id))
        });
        stats
    }

    /// Tasks waiting for a slot, across all users, optionally for one key only.
    pub fn total_queued(&self, concurrency_key: Option<&str>) -> usize {
        self.lock()
            .limiters
            .iter()
            .filter(|(k, _)| concurrency_key.map_or(true, |ck| k.concurrency_key == ck))
            .map(|(_, e)| e.limiter.queued())
            .sum()
    }

    pub fn total_active(&self) -> usize {
        self.lock()
            .limiters
            .values()
            .map(|e| e.limiter.active())
            .sum()
    }

    /// Drop every idle limiter. Limiters with running or queued work are kept.
    pub fn reset(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.limiters.len();
        inner.limiters.retain(|_, e| !is_evictable(e));
        before - inner.limiters.len()
    }
}

fn is_evictable(entry: &Entry) -> bool {
    Arc::strong_count(&entry.limiter) == 1 && entry.limiter.is_idle()
}

fn evict_lru_idle(limiters: &mut HashMap<LimiterKey, Entry>) {
    let victim = limiters
        .iter()
        .filter(|(_, e)| is_evictable(e))
        .min_by_key(|(_, e)| e.last_used)
        .map(|(k, _)| k.clone());

    match victim {
        Some(key) => {
            debug!(concurrency_key = %key.concurrency_key, "evicting idle limiter");
            limiters.remove(&key);
        }
        None => debug!(
            live = limiters.len(),
            "limiter registry full of busy limiters; growing"
        ),
    }
}
