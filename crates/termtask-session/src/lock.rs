//! Per-session exclusive locks
//!
//! Every read-modify-write of a study session, and of the task sessions it
//! owns, runs while holding that study's lock. Locks live in this process
//! only; a [`SessionGuard`] releases on drop, so every exit path (errors,
//! panics, cancelled futures) gives the lock back.
//!
//! A guard whose study has closed can be retired: its table entry is removed
//! on release unless another caller is already waiting for it.

use crate::error::LockError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Keyed lock table
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Arc<LockTable>,
    timeout: Option<Duration>,
}

/// Held lock; released when dropped
pub struct SessionGuard {
    key: String,
    acquired_at: Instant,
    table: Arc<LockTable>,
    retired: AtomicBool,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("key", &self.key)
            .field("held_for", &self.held_for())
            .field("retired", &self.retired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SessionGuard {
    /// Key this guard holds
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// How long the lock has been held
    #[inline]
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Remove this key from the table once released
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Relaxed);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        if self.retired.load(Ordering::Relaxed) {
            // Waiters hold a clone of the mutex, so only an idle entry goes
            self.table
                .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

impl SessionLocks {
    /// Lock table that waits indefinitely
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock table with an acquisition bound
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn mutex(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> SessionGuard {
        SessionGuard {
            key: key.to_string(),
            acquired_at: Instant::now(),
            table: Arc::clone(&self.locks),
            retired: AtomicBool::new(false),
            guard: Some(guard),
        }
    }

    /// Acquire the lock for `key`, waiting while another caller holds it
    ///
    /// # Errors
    /// Returns [`LockError::Timeout`] if a timeout is configured and elapses
    pub async fn lock(&self, key: &str) -> Result<SessionGuard, LockError> {
        let mutex = self.mutex(key);
        let started = Instant::now();
        let guard = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, mutex.lock_owned())
                .await
                .map_err(|_| LockError::Timeout {
                    key: key.to_string(),
                    waited_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                })?,
            None => mutex.lock_owned().await,
        };
        tracing::debug!(key, waited_us = micros(started.elapsed()), "lock acquired");
        Ok(self.guard(key, guard))
    }

    /// Acquire without waiting
    #[must_use]
    pub fn try_lock(&self, key: &str) -> Option<SessionGuard> {
        let guard = self.mutex(key).try_lock_owned().ok()?;
        Some(self.guard(key, guard))
    }

    /// Release a lock explicitly
    pub fn unlock(&self, guard: SessionGuard) {
        tracing::debug!(key = guard.key(), held_us = micros(guard.held_for()), "lock released");
        drop(guard);
    }

    /// Whether `guard` was handed out by this table
    #[inline]
    #[must_use]
    pub fn owns(&self, guard: &SessionGuard) -> bool {
        Arc::ptr_eq(&self.locks, &guard.table)
    }

    /// Whether `key` is currently held
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .is_some_and(|m| m.try_lock().is_err())
    }

    /// Number of keys in the table
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
