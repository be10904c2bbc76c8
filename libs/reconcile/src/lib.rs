//! Reconciliation loop primitives.
//!
//! Helpers shared by control loops that converge observed state toward
//! desired state:
//!
//! - **Spec hashing**: detect whether a running task was built from the
//!   current spec version.
//! - **Retry tracking**: per-key exponential backoff, so one failing slot is
//!   retried on its own schedule without holding back its siblings.
//! - **Rolling updates**: how many outdated slots may be replaced per pass.
//!
//! # Invariants
//!
//! - All helpers are deterministic given the same inputs (time is passed in)
//! - Nothing here performs I/O

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Observed state matches desired state.
    Converged,

    /// Observed state is moving toward desired state.
    Converging,

    /// Progress is blocked (no eligible node, binding failures).
    Degraded,
}

impl ConvergenceStatus {
    /// Classify a replicated resource from its desired and running counts.
    pub fn from_counts(desired: u64, running: u64, blocked: u64) -> Self {
        if desired == running {
            Self::Converged
        } else if blocked > 0 {
            Self::Degraded
        } else {
            Self::Converging
        }
    }

    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A spec hash for deterministic comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    /// Hash any serializable value through its canonical JSON form.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(|v| Self::from_json(&v))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", quote(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => quote(s),
        other => other.to_string(),
    }
}

fn quote(s: &str) -> String {
    // serde_json string serialization is already canonical for a given input
    serde_json::Value::String(s.to_string()).to_string()
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max: Duration,

    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(32) as i32);
        let millis = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Clone)]
struct FailureRecord {
    attempts: u32,
    first_failure: Instant,
    retry_at: Instant,
}

/// Per-key failure tracking with exponential backoff.
///
/// Keys are independent: a failure recorded for one key never delays another.
#[derive(Debug, Clone)]
pub struct RetryTracker<K> {
    policy: BackoffPolicy,

    /// Failures older than this are forgotten.
    window: Duration,

    failures: HashMap<K, FailureRecord>,
}

impl<K: Eq + Hash + Clone> RetryTracker<K> {
    /// Create a new retry tracker.
    pub fn new(policy: BackoffPolicy, window: Duration) -> Self {
        Self {
            policy,
            window,
            failures: HashMap::new(),
        }
    }

    /// Record a failure for `key` at `now`.
    ///
    /// Returns the instant before which the key should not be retried.
    pub fn record_failure(&mut self, key: K, now: Instant) -> Instant {
        let window = self.window;
        let record = self.failures.entry(key).or_insert(FailureRecord {
            attempts: 0,
            first_failure: now,
            retry_at: now,
        });

        if now.saturating_duration_since(record.first_failure) > window {
            record.attempts = 0;
            record.first_failure = now;
        }

        let delay = self.policy.delay(record.attempts);
        record.attempts += 1;
        record.retry_at = now + delay;
        record.retry_at
    }

    /// Returns true if `key` may be attempted at `now`.
    pub fn is_ready(&self, key: &K, now: Instant) -> bool {
        self.failures
            .get(key)
            .is_none_or(|record| now >= record.retry_at)
    }

    /// Number of failures recorded for `key` within the window.
    pub fn attempts(&self, key: &K) -> u32 {
        self.failures.get(key).map_or(0, |r| r.attempts)
    }

    /// Instant at which `key` becomes ready, if it is currently backing off.
    pub fn retry_at(&self, key: &K) -> Option<Instant> {
        self.failures.get(key).map(|r| r.retry_at)
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Drop entries whose window has expired.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.failures
            .retain(|_, r| now.saturating_duration_since(r.first_failure) <= window);
    }
}

/// Rolling update budget.
///
/// Decides how many slots still running an outdated spec may be replaced in
/// one pass. Replacement is stop-first: the old task is shut down and the slot
/// refilled, so each slot under replacement costs one unit of parallelism
/// until its new task is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateBudget {
    /// Maximum slots replaced at once; 0 means unlimited.
    pub parallelism: u64,
}

impl UpdateBudget {
    /// Number of outdated slots that may start replacement now.
    pub fn replaceable(&self, outdated: u64, updating: u64) -> u64 {
        if self.parallelism == 0 {
            return outdated;
        }
        self.parallelism.saturating_sub(updating).min(outdated)
    }
}

/// Default interval of the safety-net sweep.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Default window after which a slot's failure history is forgotten.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);
