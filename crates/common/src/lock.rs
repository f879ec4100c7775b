//! Named TTL leases serializing calendar mutations.
//!
//! Every mutating path in the core runs inside a lease on the single
//! calendar key. Leases expire after a TTL, so a crashed holder frees the
//! key without operator intervention; `acquire` blocks, retrying with
//! randomized backoff until the lease is granted. The informational tag
//! names which critical section holds the key and shows up in logs.
//!
//! Releasing is idempotent and also happens on drop, so every exit path of
//! a critical section (including `?` early returns) gives the key back.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The one key all calendar mutations serialize through.
pub const CALENDAR_LOCK_KEY: &str = "calendar-lock";

const DEFAULT_TTL: Duration = Duration::from_secs(15);
const RETRY_MIN_MS: u64 = 3_000;
const RETRY_MAX_MS: u64 = 6_000;

struct LeaseState {
    token: u64,
    tag: String,
    expires_at: Instant,
}

struct Shared {
    leases: Mutex<HashMap<String, LeaseState>>,
    ttl: Duration,
}

/// Named TTL leases.
///
/// In-process backend; a multi-process deployment points every stack at a
/// shared backend behind the same interface. The semantics callers rely on
/// (TTL reclaim, blocking acquire, idempotent release) are identical.
#[derive(Clone)]
pub struct LockService {
    shared: Arc<Shared>,
    next_token: Arc<Mutex<u64>>,
}

impl LockService {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        LockService {
            shared: Arc::new(Shared {
                leases: Mutex::new(HashMap::new()),
                ttl,
            }),
            next_token: Arc::new(Mutex::new(1)),
        }
    }

    /// Acquire the lease on `key`, blocking until granted.
    ///
    /// Contention backs off for a randomized 3-6 s before the next attempt;
    /// there is no attempt cap. An expired lease (holder failure) is
    /// reclaimed immediately.
    pub async fn acquire(&self, key: &str, tag: &str) -> LockLease {
        loop {
            if let Some(lease) = self.try_acquire(key, tag) {
                return lease;
            }
            let backoff = rand::thread_rng().gen_range(RETRY_MIN_MS..=RETRY_MAX_MS);
            debug!(key, tag, backoff_ms = backoff, "lock contended, backing off");
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self, key: &str, tag: &str) -> Option<LockLease> {
        let mut leases = self.shared.leases.lock();
        let now = Instant::now();
        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return None;
            }
            warn!(key, tag = %existing.tag, "reclaiming expired lease");
        }
        let token = {
            let mut next = self.next_token.lock();
            let t = *next;
            *next += 1;
            t
        };
        leases.insert(
            key.to_string(),
            LeaseState {
                token,
                tag: tag.to_string(),
                expires_at: now + self.shared.ttl,
            },
        );
        debug!(key, tag, token, "lease acquired");
        Some(LockLease {
            shared: Arc::clone(&self.shared),
            key: key.to_string(),
            token,
            released: false,
        })
    }
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}

/// A held lease. Release explicitly at the end of the critical section;
/// dropping an unreleased lease releases it as well.
pub struct LockLease {
    shared: Arc<Shared>,
    key: String,
    token: u64,
    released: bool,
}

impl LockLease {
    /// Idempotent release. Safe to call on every exit path.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut leases = self.shared.leases.lock();
        // only remove if we still hold it (TTL may have let someone else in)
        if leases.get(&self.key).map(|l| l.token) == Some(self.token) {
            leases.remove(&self.key);
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_reacquire() {
        let locks = LockService::new();
        let mut a = locks.try_acquire("k", "calendar").expect("free lock");
        assert!(locks.try_acquire("k", "calendar").is_none());
        a.release();
        assert!(locks.try_acquire("k", "calendar").is_some());
    }

    #[test]
    fn release_is_idempotent() {
        let locks = LockService::new();
        let mut a = locks.try_acquire("k", "genesis").unwrap();
        a.release();
        a.release();
        assert!(locks.try_acquire("k", "genesis").is_some());
    }

    #[test]
    fn drop_releases() {
        let locks = LockService::new();
        {
            let _a = locks.try_acquire("k", "reward").unwrap();
            assert!(locks.try_acquire("k", "reward").is_none());
        }
        assert!(locks.try_acquire("k", "reward").is_some());
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let locks = LockService::with_ttl(Duration::from_millis(50));
        let mut stale = locks.try_acquire("k", "btc-anchor").unwrap();
        std::thread::sleep(Duration::from_millis(80));
        // TTL elapsed: a new holder may take the key
        let _fresh = locks.try_acquire("k", "btc-confirm").expect("reclaim");
        // the stale holder's release must not evict the new holder
        stale.release();
        assert!(locks.try_acquire("k", "calendar").is_none());
    }

    #[test]
    fn independent_keys() {
        let locks = LockService::new();
        let _a = locks.try_acquire("k1", "calendar").unwrap();
        assert!(locks.try_acquire("k2", "calendar").is_some());
    }

    #[tokio::test]
    async fn blocking_acquire_returns_once_free() {
        let locks = LockService::with_ttl(Duration::from_millis(20));
        let _stale = locks.try_acquire("k", "calendar").unwrap();
        // expires within the first backoff window; acquire() must get it
        let lease = tokio::time::timeout(Duration::from_secs(10), locks.acquire("k", "calendar"))
            .await
            .expect("acquire should succeed after TTL expiry");
        drop(lease);
    }
}
