//! Login throttling.
//!
//! Failed logins are counted per [`LockoutIdentity`] (client fingerprint plus
//! target email) inside a rolling window. Reaching the threshold locks the
//! identity for a fixed duration. The guard is consulted before credentials
//! are checked and updated afterwards.
//!
//! [`MemoryLockoutStore`] is process-local. Running several server instances
//! behind a load balancer needs a shared [`LockoutStore`] instead, otherwise
//! each instance counts separately.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::AuthError;
use super::normalize_email;
use crate::clock::Clock;
use crate::tasks::spawn_periodic;

/// Throttling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Rolling window in which failures accumulate.
    pub window: Duration,
    /// Failures within the window that trigger a lock.
    pub max_attempts: u32,
    /// How long a lock lasts.
    pub lockout_duration: Duration,
    /// How often stale records are swept.
    pub sweep_interval: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            window: Duration::minutes(15),
            max_attempts: 5,
            lockout_duration: Duration::minutes(15),
            sweep_interval: Duration::minutes(5),
        }
    }
}

/// Key a lockout record is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockoutIdentity(String);

impl LockoutIdentity {
    /// Combine a client fingerprint with the (normalized) target email.
    ///
    /// The pair is hashed so raw addresses and IPs are not held as map keys.
    pub fn new(client_fingerprint: &str, email: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(client_fingerprint.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_email(email).as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Failed-attempt record for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAttempt {
    pub count: u32,
    pub last_attempt: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LoginAttempt {
    /// Whole seconds until the lock lifts, rounded up. `None` when not locked.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        let until = self.locked_until?;
        if until <= now {
            return None;
        }
        let millis = (until - now).num_milliseconds();
        Some(((millis + 999) / 1000).max(1) as u64)
    }

    /// Not locked and idle for longer than `max_idle`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_idle: Duration) -> bool {
        let lock_over = self.locked_until.is_none_or(|until| until <= now);
        lock_over && now - self.last_attempt > max_idle
    }
}

/// Outcome of [`LockoutGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutDecision {
    Allowed,
    Locked { retry_after_secs: u64 },
}

/// Record mutation applied atomically by [`LockoutStore::update`].
pub type AttemptUpdate = Box<dyn FnOnce(Option<LoginAttempt>) -> Option<LoginAttempt> + Send>;

/// Storage for lockout records.
#[async_trait]
pub trait LockoutStore: Send + Sync {
    async fn get(&self, key: &LockoutIdentity) -> Result<Option<LoginAttempt>, AuthError>;

    /// Replace the record with `f(current)`; `None` removes it. Returns the
    /// new record.
    async fn update(
        &self,
        key: &LockoutIdentity,
        f: AttemptUpdate,
    ) -> Result<Option<LoginAttempt>, AuthError>;

    async fn remove(&self, key: &LockoutIdentity) -> Result<(), AuthError>;

    /// Drop stale records. Returns how many were removed.
    async fn sweep(&self, now: DateTime<Utc>, max_idle: Duration) -> Result<usize, AuthError>;
}

/// Process-local [`LockoutStore`].
#[derive(Debug, Default)]
pub struct MemoryLockoutStore {
    records: DashMap<LockoutIdentity, LoginAttempt>,
}

impl MemoryLockoutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl LockoutStore for MemoryLockoutStore {
    async fn get(&self, key: &LockoutIdentity) -> Result<Option<LoginAttempt>, AuthError> {
        Ok(self.records.get(key).map(|r| *r))
    }

    async fn update(
        &self,
        key: &LockoutIdentity,
        f: AttemptUpdate,
    ) -> Result<Option<LoginAttempt>, AuthError> {
        // The entry holds the shard lock, so concurrent failures for one key
        // serialize here.
        let next = match self.records.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match f(Some(*occupied.get())) {
                Some(next) => {
                    occupied.insert(next);
                    Some(next)
                }
                None => {
                    occupied.remove();
                    None
                }
            },
            Entry::Vacant(vacant) => f(None).inspect(|next| {
                vacant.insert(*next);
            }),
        };
        Ok(next)
    }

    async fn remove(&self, key: &LockoutIdentity) -> Result<(), AuthError> {
        self.records.remove(key);
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>, max_idle: Duration) -> Result<usize, AuthError> {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_stale(now, max_idle));
        Ok(before.saturating_sub(self.records.len()))
    }
}

/// Applies a [`LockoutPolicy`] over a [`LockoutStore`].
#[derive(Clone)]
pub struct LockoutGuard {
    store: Arc<dyn LockoutStore>,
    policy: LockoutPolicy,
}

impl std::fmt::Debug for LockoutGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockoutGuard")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LockoutGuard {
    pub fn new(store: Arc<dyn LockoutStore>, policy: LockoutPolicy) -> Self {
        Self { store, policy }
    }

    /// Guard over a fresh [`MemoryLockoutStore`].
    pub fn in_memory(policy: LockoutPolicy) -> Self {
        Self::new(Arc::new(MemoryLockoutStore::new()), policy)
    }

    /// Whether a login attempt for `identity` may proceed.
    pub async fn check(
        &self,
        identity: &LockoutIdentity,
        now: DateTime<Utc>,
    ) -> Result<LockoutDecision, AuthError> {
        let decision = match self.store.get(identity).await? {
            Some(record) => match record.retry_after_secs(now) {
                Some(retry_after_secs) => LockoutDecision::Locked { retry_after_secs },
                None => LockoutDecision::Allowed,
            },
            None => LockoutDecision::Allowed,
        };
        Ok(decision)
    }

    /// Reserve a login attempt before credentials are checked.
    ///
    /// One atomic store update: an active lock rejects the attempt (and is
    /// not extended), otherwise the attempt is counted up front and the
    /// identity locks once the count reaches `max_attempts`. Concurrent
    /// attempts for one identity cannot all pass the check. A correct
    /// password clears the record through [`Self::record_success`].
    pub async fn begin_attempt(
        &self,
        identity: &LockoutIdentity,
        now: DateTime<Utc>,
    ) -> Result<LockoutDecision, AuthError> {
        let policy = self.policy;
        let record = self
            .store
            .update(
                identity,
                Box::new(move |current: Option<LoginAttempt>| {
                    Some(match current {
                        Some(prev) if prev.retry_after_secs(now).is_some() => LoginAttempt {
                            count: prev.count.saturating_add(1),
                            last_attempt: now,
                            locked_until: prev.locked_until,
                        },
                        other => next_failure(other, now, &policy),
                    })
                }),
            )
            .await?
            .ok_or_else(|| AuthError::Internal("lockout update dropped record".into()))?;

        if record.count > policy.max_attempts
            && let Some(retry_after_secs) = record.retry_after_secs(now)
        {
            return Ok(LockoutDecision::Locked { retry_after_secs });
        }
        self.log_threshold(identity, &record);
        Ok(LockoutDecision::Allowed)
    }

    /// Count a failed attempt, locking the identity at the threshold.
    ///
    /// The counter restarts at 1 when the previous attempt is older than the
    /// window or a previous lock has lifted. Attempts reserved through
    /// [`Self::begin_attempt`] are already counted.
    pub async fn record_failure(
        &self,
        identity: &LockoutIdentity,
        now: DateTime<Utc>,
    ) -> Result<LoginAttempt, AuthError> {
        let policy = self.policy;
        let updated = self
            .store
            .update(
                identity,
                Box::new(move |current: Option<LoginAttempt>| {
                    Some(next_failure(current, now, &policy))
                }),
            )
            .await?
            .ok_or_else(|| AuthError::Internal("lockout update dropped record".into()))?;
        self.log_threshold(identity, &updated);
        Ok(updated)
    }

    fn log_threshold(&self, identity: &LockoutIdentity, record: &LoginAttempt) {
        if record.count == self.policy.max_attempts {
            info!(
                identity = identity.as_str(),
                locked_until = ?record.locked_until,
                "login identity locked out"
            );
        }
    }

    /// Clear the identity's record after a successful login.
    pub async fn record_success(&self, identity: &LockoutIdentity) -> Result<(), AuthError> {
        self.store.remove(identity).await
    }

    /// Remove records idle for more than twice the window with no active lock.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        self.store.sweep(now, self.policy.window * 2).await
    }

    /// Run [`Self::sweep`] every `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, clock: Clock, cancel: CancellationToken) -> JoinHandle<()> {
        let period = self.policy.sweep_interval.to_std().unwrap_or_else(|_| {
            warn!("invalid lockout sweep interval, using 5 minutes");
            std::time::Duration::from_secs(300)
        });
        let guard = self.clone();
        spawn_periodic("lockout-sweep", period, cancel, move || {
            let guard = guard.clone();
            let now = clock.now();
            async move { guard.sweep(now).await }
        })
    }
}

/// Record after one more failure on top of `current`.
fn next_failure(
    current: Option<LoginAttempt>,
    now: DateTime<Utc>,
    policy: &LockoutPolicy,
) -> LoginAttempt {
    let count = match current {
        Some(prev)
            if now - prev.last_attempt <= policy.window
                && prev.locked_until.is_none_or(|until| until > now) =>
        {
            prev.count.saturating_add(1)
        }
        _ => 1,
    };
    let locked_until = (count >= policy.max_attempts).then(|| now + policy.lockout_duration);
    LoginAttempt {
        count,
        last_attempt: now,
        locked_until,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard() -> (LockoutGuard, Arc<MemoryLockoutStore>) {
        let store = Arc::new(MemoryLockoutStore::new());
        let guard = LockoutGuard::new(store.clone(), LockoutPolicy::default());
        (guard, store)
    }

    fn identity() -> LockoutIdentity {
        LockoutIdentity::new("203.0.113.7|Mozilla/5.0", "alice@example.com")
    }

    #[test]
    fn identity_depends_on_fingerprint_and_normalized_email() {
        let a = LockoutIdentity::new("ip-a", "Alice@Example.com");
        assert_eq!(a, LockoutIdentity::new("ip-a", "alice@example.com"));
        assert_ne!(a, LockoutIdentity::new("ip-b", "alice@example.com"));
        assert_ne!(a, LockoutIdentity::new("ip-a", "bob@example.com"));
    }

    #[test]
    fn retry_after_rounds_up() {
        let now = Utc::now();
        let record = LoginAttempt {
            count: 5,
            last_attempt: now,
            locked_until: Some(now + Duration::milliseconds(1500)),
        };
        assert_eq!(record.retry_after_secs(now), Some(2));
        assert_eq!(record.retry_after_secs(now + Duration::seconds(2)), None);
    }

    #[tokio::test]
    async fn fifth_failure_locks_sixth_attempt() {
        let (guard, _) = guard();
        let id = identity();
        let now = Utc::now();
        for n in 1..=5 {
            assert_eq!(guard.check(&id, now).await.expect("check"), LockoutDecision::Allowed);
            let record = guard.record_failure(&id, now).await.expect("failure");
            assert_eq!(record.count, n);
        }
        match guard.check(&id, now).await.expect("check") {
            LockoutDecision::Locked { retry_after_secs } => assert_eq!(retry_after_secs, 15 * 60),
            other => panic!("expected lock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reserved_attempts_lock_after_threshold() {
        let (guard, _) = guard();
        let id = identity();
        let clock = ManualClock::new(Utc::now());
        for _ in 0..5 {
            assert_eq!(
                guard.begin_attempt(&id, clock.now()).await.expect("attempt"),
                LockoutDecision::Allowed
            );
        }
        for _ in 0..3 {
            match guard.begin_attempt(&id, clock.now()).await.expect("attempt") {
                LockoutDecision::Locked { retry_after_secs } => {
                    assert_eq!(retry_after_secs, 15 * 60)
                }
                other => panic!("expected lock, got {other:?}"),
            }
        }

        clock.advance(Duration::minutes(15) + Duration::seconds(1));
        assert_eq!(
            guard.begin_attempt(&id, clock.now()).await.expect("attempt"),
            LockoutDecision::Allowed
        );
    }

    #[tokio::test]
    async fn rejected_attempts_do_not_extend_the_lock() {
        let (guard, store) = guard();
        let id = identity();
        let clock = ManualClock::new(Utc::now());
        for _ in 0..5 {
            guard.begin_attempt(&id, clock.now()).await.expect("attempt");
        }
        let locked_until = store.get(&id).await.expect("get").and_then(|r| r.locked_until);
        clock.advance(Duration::minutes(10));
        guard.begin_attempt(&id, clock.now()).await.expect("attempt");
        let after = store.get(&id).await.expect("get").and_then(|r| r.locked_until);
        assert_eq!(after, locked_until);
    }

    #[tokio::test]
    async fn success_clears_reserved_attempts() {
        let (guard, store) = guard();
        let id = identity();
        let now = Utc::now();
        for _ in 0..5 {
            guard.begin_attempt(&id, now).await.expect("attempt");
        }
        guard.record_success(&id).await.expect("success");
        assert!(store.is_empty());
        assert_eq!(
            guard.begin_attempt(&id, now).await.expect("attempt"),
            LockoutDecision::Allowed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts_cannot_exceed_threshold() {
        let (guard, _) = guard();
        let now = Utc::now();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move {
                guard.begin_attempt(&identity(), now).await.expect("attempt")
            }));
        }
        let mut allowed = 0;
        for task in tasks {
            if task.await.expect("join") == LockoutDecision::Allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn success_before_threshold_clears_counter() {
        let (guard, store) = guard();
        let id = identity();
        let now = Utc::now();
        for _ in 0..4 {
            guard.record_failure(&id, now).await.expect("failure");
        }
        guard.record_success(&id).await.expect("success");
        assert!(store.is_empty());
        let record = guard.record_failure(&id, now).await.expect("failure");
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn lock_lifts_and_starts_new_window() {
        let (guard, _) = guard();
        let id = identity();
        let clock = ManualClock::new(Utc::now());
        for _ in 0..5 {
            guard.record_failure(&id, clock.now()).await.expect("failure");
        }
        clock.advance(Duration::minutes(15) + Duration::seconds(1));
        assert_eq!(
            guard.check(&id, clock.now()).await.expect("check"),
            LockoutDecision::Allowed
        );
        let record = guard.record_failure(&id, clock.now()).await.expect("failure");
        assert_eq!(record.count, 1);
        assert!(record.locked_until.is_none());
    }

    #[tokio::test]
    async fn window_expiry_resets_count() {
        let (guard, _) = guard();
        let id = identity();
        let clock = ManualClock::new(Utc::now());
        for _ in 0..4 {
            guard.record_failure(&id, clock.now()).await.expect("failure");
        }
        clock.advance(Duration::minutes(16));
        let record = guard.record_failure(&id, clock.now()).await.expect("failure");
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn other_fingerprint_is_not_locked() {
        let (guard, _) = guard();
        let attacker = LockoutIdentity::new("198.51.100.1|curl", "alice@example.com");
        let now = Utc::now();
        for _ in 0..5 {
            guard.record_failure(&attacker, now).await.expect("failure");
        }
        assert_eq!(
            guard.check(&identity(), now).await.expect("check"),
            LockoutDecision::Allowed
        );
    }

    #[tokio::test]
    async fn sweep_keeps_active_locks_and_recent_records() {
        let (guard, store) = guard();
        let now = Utc::now();
        let locked = LockoutIdentity::new("a", "locked@example.com");
        let idle = LockoutIdentity::new("b", "idle@example.com");
        for _ in 0..5 {
            guard.record_failure(&locked, now).await.expect("failure");
        }
        guard.record_failure(&idle, now).await.expect("failure");

        assert_eq!(guard.sweep(now + Duration::minutes(10)).await.expect("sweep"), 0);
        assert_eq!(store.len(), 2);

        // Past 2x window: idle record goes, lock has also lifted by then.
        assert_eq!(guard.sweep(now + Duration::minutes(31)).await.expect("sweep"), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_cancel() {
        let guard = LockoutGuard::in_memory(LockoutPolicy {
            sweep_interval: Duration::milliseconds(5),
            ..LockoutPolicy::default()
        });
        let cancel = CancellationToken::new();
        let handle = guard.spawn_sweeper(Clock::system(), cancel.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.expect("sweeper joins");
    }
}
