//! Cross-process migration lock built on PostgreSQL advisory locks.
//!
//! Every replica of a service agrees on one 64-bit key. The coordinator polls
//! `pg_try_advisory_lock(key)` until it wins or `max_wait` elapses. Losing the race is not an
//! error: the caller assumes another replica is migrating (or already has) and moves on.

use crate::executor::{AdvisoryLock, DbError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Monotonic time source with a sleep, so waits can be simulated in tests.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

/// Wall clock. Sleeps yield to the `may` scheduler when called from a coroutine.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        may::coroutine::sleep(duration);
    }
}

/// Derive a stable advisory lock key from the application name.
///
/// Takes the first eight bytes of `SHA-256("launchguard:" + name)` as a big-endian `i64`.
pub fn derive_lock_key(application_name: &str) -> i64 {
    let digest = Sha256::digest(format!("launchguard:{}", application_name).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Acquires and releases the migration advisory lock with bounded polling.
#[derive(Clone)]
pub struct LockCoordinator {
    clock: Arc<dyn Clock>,
}

impl LockCoordinator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// One non-blocking attempt.
    pub fn try_acquire<L: AdvisoryLock + ?Sized>(&self, key: i64, lock: &L) -> Result<bool, DbError> {
        lock.try_advisory_lock(key)
    }

    /// Poll [`try_acquire`](Self::try_acquire) every `poll_interval` until it succeeds.
    ///
    /// The first attempt is made immediately, even when `max_wait` is zero, and the last one
    /// when `max_wait` is reached. Sleeps never run past `max_wait`. Returns `Ok(false)` when
    /// no attempt won the lock.
    pub fn acquire<L: AdvisoryLock + ?Sized>(
        &self,
        key: i64,
        lock: &L,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<bool, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(key).entered();

        let started = self.clock.now();
        let mut attempts = 0u32;
        log::info!(
            "waiting for migration lock lock_key={} max_wait_s={}",
            key,
            max_wait.as_secs()
        );

        loop {
            attempts += 1;
            if self.try_acquire(key, lock)? {
                let waited = self.clock.now().saturating_sub(started);
                log::info!(
                    "acquired migration lock lock_key={} attempts={} waited_ms={}",
                    key,
                    attempts,
                    waited.as_millis()
                );
                #[cfg(feature = "metrics")]
                crate::metrics::METRICS.record_lock_wait(waited);
                return Ok(true);
            }
            log::debug!("migration lock busy lock_key={} attempt={}", key, attempts);

            let elapsed = self.clock.now().saturating_sub(started);
            if elapsed >= max_wait {
                break;
            }
            self.clock.sleep(poll_interval.min(max_wait - elapsed));
        }

        log::warn!(
            "timed out waiting for migration lock lock_key={} attempts={} max_wait_s={}",
            key,
            attempts,
            max_wait.as_secs()
        );
        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_lock_timeout();
        Ok(false)
    }

    /// Best-effort unlock. Skipped when the connection is already closed, never fails.
    pub fn release<L: AdvisoryLock + ?Sized>(&self, key: i64, lock: &L) {
        if !lock.is_open() {
            log::debug!("session closed, advisory lock already released lock_key={}", key);
            return;
        }
        match lock.advisory_unlock(key) {
            Ok(true) => log::info!("released migration lock lock_key={}", key),
            Ok(false) => log::debug!("migration lock was not held lock_key={}", key),
            Err(e) => log::warn!("failed to release migration lock lock_key={}: {}", key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Database;
    use crate::testing::{InMemoryDatabase, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: i64 = 7_243_102;

    fn coordinator(clock: &Arc<ManualClock>) -> LockCoordinator {
        LockCoordinator::new(clock.clone())
    }

    #[test]
    fn test_acquire_free_lock_first_attempt() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::new();
        let session = db.open("memory").unwrap();

        let acquired = coordinator(&clock)
            .acquire(KEY, &session, Duration::from_secs(60), Duration::from_secs(5))
            .unwrap();

        assert!(acquired);
        assert_eq!(db.lock_attempts(), 1);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_acquire_times_out_at_max_wait() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::new();
        db.hold_lock_elsewhere(KEY);
        let session = db.open("memory").unwrap();

        let acquired = coordinator(&clock)
            .acquire(KEY, &session, Duration::from_secs(60), Duration::from_secs(5))
            .unwrap();

        assert!(!acquired);
        // t = 0, 5, ..., 60
        assert_eq!(db.lock_attempts(), 13);
        assert_eq!(clock.sleeps().len(), 12);
        assert_eq!(clock.now(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_max_wait_still_tries_once() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::new();
        let session = db.open("memory").unwrap();

        let acquired = coordinator(&clock)
            .acquire(KEY, &session, Duration::ZERO, Duration::from_secs(5))
            .unwrap();

        assert!(acquired);
        assert_eq!(db.lock_attempts(), 1);

        let other = db.open("memory").unwrap();
        let acquired = coordinator(&clock)
            .acquire(KEY, &other, Duration::ZERO, Duration::from_secs(5))
            .unwrap();
        assert!(!acquired);
        assert_eq!(db.lock_attempts(), 2);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_last_sleep_is_capped_at_max_wait() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::new();
        db.hold_lock_elsewhere(KEY);
        let session = db.open("memory").unwrap();

        let acquired = coordinator(&clock)
            .acquire(KEY, &session, Duration::from_secs(7), Duration::from_secs(5))
            .unwrap();

        assert!(!acquired);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5), Duration::from_secs(2)]);
        assert_eq!(db.lock_attempts(), 3);
        assert_eq!(clock.now(), Duration::from_secs(7));
    }

    #[test]
    fn test_acquire_succeeds_once_competitor_releases() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::new();
        let competitor = db.open("memory").unwrap();
        assert!(competitor.try_advisory_lock(KEY).unwrap());
        let session = db.open("memory").unwrap();

        let coordinator = coordinator(&clock);
        assert!(!coordinator.try_acquire(KEY, &session).unwrap());
        coordinator.release(KEY, &competitor);
        assert!(coordinator.try_acquire(KEY, &session).unwrap());
    }

    #[test]
    fn test_release_is_idempotent() {
        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::new();
        let session = db.open("memory").unwrap();
        let coordinator = coordinator(&clock);

        coordinator.release(KEY, &session);
        assert!(coordinator.try_acquire(KEY, &session).unwrap());
        coordinator.release(KEY, &session);
        coordinator.release(KEY, &session);
        assert!(!db.is_lock_held(KEY));
    }

    #[test]
    fn test_release_skips_closed_session() {
        use crate::executor::Session;

        let clock = Arc::new(ManualClock::new());
        let db = InMemoryDatabase::new();
        let mut session = db.open("memory").unwrap();
        assert!(session.try_advisory_lock(KEY).unwrap());
        session.close();

        coordinator(&clock).release(KEY, &session);
        assert_eq!(db.unlock_calls(), 0);
        assert!(!db.is_lock_held(KEY));
    }

    #[test]
    fn test_concurrent_coordinators_are_mutually_exclusive() {
        let db = InMemoryDatabase::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let winners = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..6 {
                let db = db.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                let winners = winners.clone();
                scope.spawn(move || {
                    let coordinator = LockCoordinator::new(Arc::new(SystemClock::new()));
                    let session = db.open("memory").unwrap();
                    let acquired = coordinator
                        .acquire(KEY, &session, Duration::from_secs(10), Duration::from_millis(1))
                        .unwrap();
                    assert!(acquired);

                    let now_inside = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now_inside, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    winners.fetch_add(1, Ordering::SeqCst);

                    coordinator.release(KEY, &session);
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(winners.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_derive_lock_key_differs_per_application() {
        assert_eq!(derive_lock_key("catalog"), derive_lock_key("catalog"));
        assert_ne!(derive_lock_key("catalog"), derive_lock_key("orders"));
    }
}
