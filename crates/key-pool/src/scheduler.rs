//! Round-robin key selection under per-key rolling quotas
//!
//! The scheduler owns one usage window per key. Windows reset lazily: when a
//! key is looked at and its window is at least `window` old, its count drops
//! back to zero. There is no background timer.
//!
//! One async mutex guards the whole ledger (every window plus the rotation
//! cursor), so a scan-and-increment is atomic with respect to every other
//! caller and round-robin order holds under contention.

use std::time::Duration;

use provider::Credential;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Uses granted per key per window unless configured otherwise.
pub const DEFAULT_USES_PER_WINDOW: u32 = 2;

/// Window length unless configured otherwise.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// How long a saturated `acquire()` sleeps before rescanning.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-key quota: at most `uses_per_window` grants per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub uses_per_window: u32,
    pub window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            uses_per_window: DEFAULT_USES_PER_WINDOW,
            window: DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageWindow {
    count: u32,
    started: Instant,
}

impl UsageWindow {
    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.started) >= window
    }
}

struct Slot {
    credential: Credential,
    usage: UsageWindow,
}

/// All mutable scheduler state. Only touched while holding the mutex.
struct Ledger {
    slots: Vec<Slot>,
    cursor: usize,
}

impl Ledger {
    /// One full cycle starting at the cursor. Grants the first key with spare
    /// quota and moves the cursor past it.
    fn grant(&mut self, now: Instant, policy: QuotaPolicy) -> Option<Credential> {
        let n = self.slots.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            let slot = &mut self.slots[idx];

            if slot.usage.expired(now, policy.window) {
                slot.usage = UsageWindow {
                    count: 0,
                    started: now,
                };
            }

            if slot.usage.count < policy.uses_per_window {
                slot.usage.count += 1;
                self.cursor = (idx + 1) % n;
                return Some(slot.credential.clone());
            }
        }
        None
    }
}

/// Usage of one key at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialUsage {
    pub label: String,
    pub uses: u32,
    pub remaining: u32,
    /// Time until the current window resets. Zero when no window is open.
    pub resets_in: Duration,
}

/// Read-only view of the ledger for health reporting. Never contains keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub policy: QuotaPolicy,
    pub credentials: Vec<CredentialUsage>,
}

impl PoolSnapshot {
    /// Keys that could be granted right now.
    pub fn available(&self) -> usize {
        self.credentials.iter().filter(|c| c.remaining > 0).count()
    }

    /// `healthy` if any key has spare quota, else `saturated`.
    pub fn status(&self) -> &'static str {
        if self.available() > 0 {
            "healthy"
        } else {
            "saturated"
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let credentials: Vec<serde_json::Value> = self
            .credentials
            .iter()
            .map(|c| {
                serde_json::json!({
                    "label": c.label,
                    "uses": c.uses,
                    "remaining": c.remaining,
                    "resets_in_secs": c.resets_in.as_secs(),
                })
            })
            .collect();

        serde_json::json!({
            "status": self.status(),
            "uses_per_window": self.policy.uses_per_window,
            "window_secs": self.policy.window.as_secs(),
            "credentials_total": self.credentials.len(),
            "credentials_available": self.available(),
            "credentials": credentials,
        })
    }
}

/// Hands out API keys round-robin under a per-key rolling quota.
///
/// Shared between request handlers via `Arc`.
pub struct CredentialScheduler {
    ledger: Mutex<Ledger>,
    policy: QuotaPolicy,
    poll_interval: Duration,
    size: usize,
}

impl CredentialScheduler {
    /// Build the pool. Keys keep the given order; the first grant goes to the
    /// first key. A key value listed more than once is kept only at its first
    /// position, so one key can never be granted beyond its quota.
    ///
    /// Fails with `EmptyPool` when `credentials` is empty and with
    /// `InvalidPolicy` for a zero quota, window or poll interval.
    pub fn new(
        credentials: Vec<Credential>,
        policy: QuotaPolicy,
        poll_interval: Duration,
    ) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::EmptyPool);
        }
        if policy.uses_per_window == 0 {
            return Err(Error::InvalidPolicy(
                "uses_per_window must be greater than 0".into(),
            ));
        }
        if policy.window.is_zero() {
            return Err(Error::InvalidPolicy("window must be non-zero".into()));
        }
        if poll_interval.is_zero() {
            return Err(Error::InvalidPolicy("poll interval must be non-zero".into()));
        }

        let mut unique: Vec<Credential> = Vec::with_capacity(credentials.len());
        for credential in credentials {
            if unique.contains(&credential) {
                warn!(credential = %credential, "dropping credential with duplicate key");
                continue;
            }
            unique.push(credential);
        }

        let now = Instant::now();
        let size = unique.len();
        let slots = unique
            .into_iter()
            .map(|credential| Slot {
                credential,
                usage: UsageWindow {
                    count: 0,
                    started: now,
                },
            })
            .collect();

        info!(
            credentials = size,
            uses_per_window = policy.uses_per_window,
            window_secs = policy.window.as_secs(),
            "credential scheduler initialized"
        );

        Ok(Self {
            ledger: Mutex::new(Ledger { slots, cursor: 0 }),
            policy,
            poll_interval,
            size,
        })
    }

    /// Number of keys in the pool.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false: construction rejects empty pools.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    /// Grant a key if one has spare quota right now, without waiting.
    pub async fn try_acquire(&self) -> Option<Credential> {
        let granted = {
            let mut ledger = self.ledger.lock().await;
            ledger.grant(Instant::now(), self.policy)
        };

        if let Some(credential) = &granted {
            debug!(credential = %credential, "credential granted");
            metrics::counter!("pool_grants_total", "credential" => credential.label().to_string())
                .increment(1);
        }
        granted
    }

    /// Grant a key, waiting as long as it takes for one to free up.
    ///
    /// While every key is saturated the caller sleeps for the poll interval
    /// and rescans. There is no timeout: if the pool stays saturated the
    /// caller waits indefinitely. Waiting callers are not served FIFO.
    pub async fn acquire(&self) -> Credential {
        let started = Instant::now();
        let mut polls = 0u64;

        loop {
            if let Some(credential) = self.try_acquire().await {
                let waited = started.elapsed();
                metrics::histogram!("pool_acquire_wait_seconds").record(waited.as_secs_f64());
                if polls > 0 {
                    info!(
                        credential = %credential,
                        waited_ms = waited.as_millis() as u64,
                        "credential available after wait"
                    );
                }
                return credential;
            }

            metrics::counter!("pool_saturated_total").increment(1);
            if polls == 0 {
                info!(
                    credentials = self.size,
                    poll_ms = self.poll_interval.as_millis() as u64,
                    "all credentials saturated, waiting for a window to reset"
                );
            } else {
                debug!(polls, "credentials still saturated");
            }
            polls += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Current usage per key. Expired windows read as fresh; nothing is reset.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let ledger = self.ledger.lock().await;
        let now = Instant::now();

        let credentials = ledger
            .slots
            .iter()
            .map(|slot| {
                let (uses, resets_in) = if slot.usage.expired(now, self.policy.window) {
                    (0, Duration::ZERO)
                } else {
                    let elapsed = now.saturating_duration_since(slot.usage.started);
                    let resets_in = if slot.usage.count == 0 {
                        Duration::ZERO
                    } else {
                        self.policy.window.saturating_sub(elapsed)
                    };
                    (slot.usage.count, resets_in)
                };
                CredentialUsage {
                    label: slot.credential.label().to_string(),
                    uses,
                    remaining: self.policy.uses_per_window.saturating_sub(uses),
                    resets_in,
                }
            })
            .collect();

        PoolSnapshot {
            policy: self.policy,
            credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn keys(n: usize) -> Vec<Credential> {
        (1..=n)
            .map(|i| Credential::new(format!("key-{i}"), format!("AIzaSy-secret-{i}")))
            .collect()
    }

    fn scheduler(n: usize, uses_per_window: u32) -> CredentialScheduler {
        CredentialScheduler::new(
            keys(n),
            QuotaPolicy {
                uses_per_window,
                window: Duration::from_secs(60),
            },
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_empty_pool() {
        let err = CredentialScheduler::new(vec![], QuotaPolicy::default(), DEFAULT_POLL_INTERVAL)
            .err()
            .unwrap();
        assert!(matches!(err, Error::EmptyPool), "got {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_zero_quota_window_and_poll_interval() {
        let zero_quota = QuotaPolicy {
            uses_per_window: 0,
            window: DEFAULT_WINDOW,
        };
        assert!(matches!(
            CredentialScheduler::new(keys(1), zero_quota, DEFAULT_POLL_INTERVAL),
            Err(Error::InvalidPolicy(_))
        ));

        let zero_window = QuotaPolicy {
            uses_per_window: 2,
            window: Duration::ZERO,
        };
        assert!(matches!(
            CredentialScheduler::new(keys(1), zero_window, DEFAULT_POLL_INTERVAL),
            Err(Error::InvalidPolicy(_))
        ));

        assert!(matches!(
            CredentialScheduler::new(keys(1), QuotaPolicy::default(), Duration::ZERO),
            Err(Error::InvalidPolicy(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_key_values_share_one_quota() {
        let pool = CredentialScheduler::new(
            vec![
                Credential::new("a", "AIzaSy-same"),
                Credential::new("b", "AIzaSy-same"),
                Credential::new("c", "AIzaSy-other"),
            ],
            QuotaPolicy::default(),
            DEFAULT_POLL_INTERVAL,
        )
        .unwrap();
        assert_eq!(pool.len(), 2);

        let mut same = 0;
        while let Some(credential) = pool.try_acquire().await {
            if credential.expose() == "AIzaSy-same" {
                same += 1;
                assert_eq!(credential.label(), "a");
            }
        }
        assert_eq!(same, 2, "one key value must get exactly one quota per window");
    }

    #[tokio::test(start_paused = true)]
    async fn defaults_match_two_uses_per_minute() {
        let policy = QuotaPolicy::default();
        assert_eq!(policy.uses_per_window, 2);
        assert_eq!(policy.window, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_hands_each_key_out_once_per_cycle() {
        let pool = scheduler(3, 2);

        let first: Vec<String> = [
            pool.acquire().await,
            pool.acquire().await,
            pool.acquire().await,
        ]
        .iter()
        .map(|c| c.label().to_string())
        .collect();
        assert_eq!(first, vec!["key-1", "key-2", "key-3"]);

        let fourth = pool.acquire().await;
        assert_eq!(fourth.label(), "key-1");
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_skips_saturated_keys() {
        let pool = scheduler(3, 1);

        assert_eq!(pool.acquire().await.label(), "key-1");
        assert_eq!(pool.acquire().await.label(), "key-2");

        // key-1 and key-2 are spent; the cursor sits on key-3
        assert_eq!(pool.acquire().await.label(), "key-3");
        assert!(pool.try_acquire().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn quota_caps_grants_per_key_within_a_window() {
        let pool = scheduler(3, 2);

        let mut grants: HashMap<String, u32> = HashMap::new();
        while let Some(credential) = pool.try_acquire().await {
            *grants.entry(credential.label().to_string()).or_default() += 1;
        }

        assert_eq!(grants.len(), 3);
        assert!(grants.values().all(|&n| n == 2), "grants: {grants:?}");
        assert!(pool.try_acquire().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_after_window_length() {
        let pool = scheduler(1, 2);
        pool.acquire().await;
        pool.acquire().await;
        assert!(pool.try_acquire().await.is_none());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(
            pool.try_acquire().await.is_none(),
            "window must not reset before 60s"
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        let credential = pool.try_acquire().await;
        assert_eq!(credential.map(|c| c.label().to_string()).as_deref(), Some("key-1"));

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.credentials[0].uses, 1, "count restarts from zero");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_window_resets() {
        let pool = scheduler(1, 2);
        let start = Instant::now();
        pool.acquire().await;
        pool.acquire().await;

        let early = tokio::time::timeout(Duration::from_secs(59), pool.acquire()).await;
        assert!(early.is_err(), "acquire returned while key was saturated");

        let credential = pool.acquire().await;
        assert_eq!(credential.label(), "key-1");
        assert!(
            start.elapsed() >= Duration::from_secs(60),
            "granted after {:?}",
            start.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_quota_per_window() {
        let pool = Arc::new(scheduler(2, 2));
        let start = Instant::now();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let credential = pool.acquire().await;
                    (credential.label().to_string(), start.elapsed())
                })
            })
            .collect();

        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }

        // 2 keys x 2 uses = 4 grants per 60s window, windows open at 0, 60, ...
        let mut per_window: HashMap<u64, u32> = HashMap::new();
        let mut per_key: HashMap<String, u32> = HashMap::new();
        for (label, elapsed) in &grants {
            *per_window.entry(elapsed.as_secs() / 60).or_default() += 1;
            *per_key.entry(label.clone()).or_default() += 1;
        }
        assert_eq!(per_window.len(), 5, "windows: {per_window:?}");
        assert!(per_window.values().all(|&n| n == 4), "windows: {per_window:?}");
        assert_eq!(per_key["key-1"], 10);
        assert_eq!(per_key["key-2"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_usage_without_keys() {
        let pool = scheduler(2, 2);
        pool.acquire().await;

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.status(), "healthy");
        assert_eq!(snapshot.available(), 2);
        assert_eq!(snapshot.credentials[0].uses, 1);
        assert_eq!(snapshot.credentials[0].remaining, 1);
        assert_eq!(snapshot.credentials[0].resets_in, Duration::from_secs(60));
        assert_eq!(snapshot.credentials[1].uses, 0);
        assert_eq!(snapshot.credentials[1].resets_in, Duration::ZERO);

        let json = snapshot.to_json().to_string();
        assert!(!json.contains("AIzaSy"), "snapshot leaked a key: {json}");
        assert!(json.contains("key-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_marks_fully_used_pool_saturated() {
        let pool = scheduler(1, 1);
        pool.acquire().await;

        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.status(), "saturated");
        assert_eq!(snapshot.to_json()["credentials_available"], 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        let snapshot = pool.snapshot().await;
        assert_eq!(snapshot.status(), "healthy");
        assert_eq!(snapshot.credentials[0].uses, 0);
    }
}
