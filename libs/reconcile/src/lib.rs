//! Convergence primitives.
//!
//! Helpers shared by the provisioning and convergence phases:
//!
//! - **Spec fingerprints**: deterministic hashes of desired state, used to
//!   detect whether an existing resource already matches what was asked for.
//! - **Retry policies**: bounded attempt counts with exponential backoff for
//!   transient failures.
//!
//! # Invariants
//!
//! - Fingerprints are stable across key order and process restarts
//! - Backoff delays never exceed the configured cap (plus jitter)
//! - A retry policy never allows fewer than one attempt

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Value could not be turned into JSON for fingerprinting.
    #[error("cannot fingerprint value: {0}")]
    Serialize(#[from] serde_json::Error),
}

// =============================================================================
// Spec Hash
// =============================================================================

/// A spec hash for deterministic comparison.
///
/// Used to detect when the desired state of a resource has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
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

    /// Compute a spec hash for any serializable value.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self, ReconcileError> {
        let json = serde_json::to_value(value)?;
        Ok(Self::from_json(&json))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
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
    // serde_json's string encoding is already canonical for a given input.
    serde_json::Value::String(s.to_string()).to_string()
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Backoff without jitter, for deterministic tests.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = 2.0_f64.powi(retry.min(30) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            let range = delay * jitter;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + spread).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded retry policy for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    max_attempts: u32,

    /// Delay schedule between attempts.
    backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, BackoffPolicy::default())
    }
}

impl RetryPolicy {
    /// Create a policy; `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay to wait after failed attempt `attempt` (1-based),
    /// or `None` when attempts are exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.backoff.delay(attempt.saturating_sub(1)))
    }
}

/// Default attempts for transient failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first retry delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Default backoff cap.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
