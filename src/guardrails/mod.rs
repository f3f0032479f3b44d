//! Request guardrails
//!
//! Body-size limits, bounded JSON decoding, fixed-window rate limiting,
//! update backlog shedding, namespace write switches, deterministic
//! sampling, per-session min-interval throttling, and per-namespace
//! retrieve concurrency. All state is process-local.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::de::DeserializeOwned;

use crate::encoding::sample_bucket;
use crate::error::{DeepMemError, Result};

/// Guardrail settings
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    /// Body cap for retrieve/forget/admin requests (`MAX_BODY_BYTES`)
    pub max_body_bytes: usize,
    /// Body cap for update requests (`MAX_UPDATE_BODY_BYTES`)
    pub max_update_body_bytes: usize,
    pub rate_limit_enabled: bool,
    pub rate_limit_window_ms: u64,
    pub retrieve_per_window: u64,
    pub update_per_window: u64,
    pub forget_per_window: u64,
    /// Pending threshold that flips updates into read-only shedding; 0 disables
    pub read_only_pending: usize,
    /// Pending threshold that rejects updates outright; 0 disables
    pub reject_pending: usize,
    /// Pending threshold that delays enqueued updates; 0 disables
    pub delay_pending: usize,
    /// Retry-After hint attached to shed responses
    pub backlog_retry_after_secs: u64,
    /// Enqueue delay applied by the delay policy
    pub backlog_delay_seconds: u64,
    /// Namespaces with writes switched off (`UPDATE_DISABLED_NAMESPACES`)
    pub disabled_namespaces: Vec<String>,
    /// Minimum gap between updates of one session; 0 disables
    pub min_interval_ms: u64,
    /// Deterministic ingest sampling rate in [0, 1]
    pub sample_rate: f64,
    /// Concurrent retrievals allowed per namespace; 0 disables the gate
    pub namespace_retrieve_concurrency: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 256 * 1024,
            max_update_body_bytes: 2 * 1024 * 1024,
            rate_limit_enabled: false,
            rate_limit_window_ms: 60_000,
            retrieve_per_window: 600,
            update_per_window: 120,
            forget_per_window: 60,
            read_only_pending: 0,
            reject_pending: 0,
            delay_pending: 0,
            backlog_retry_after_secs: 30,
            backlog_delay_seconds: 60,
            disabled_namespaces: Vec::new(),
            min_interval_ms: 0,
            sample_rate: 1.0,
            namespace_retrieve_concurrency: 0,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reject bodies whose declared length exceeds the limit
pub fn check_content_length(content_length: Option<usize>, limit: usize) -> Result<()> {
    if let Some(got) = content_length {
        if got > limit {
            return Err(DeepMemError::PayloadTooLarge { got, limit });
        }
    }
    Ok(())
}

/// Bounded JSON decode: the body is size-checked before parsing
pub fn decode_json<T: DeserializeOwned>(body: &[u8], limit: usize) -> Result<T> {
    if body.len() > limit {
        return Err(DeepMemError::PayloadTooLarge {
            got: body.len(),
            limit,
        });
    }
    serde_json::from_slice(body).map_err(|e| DeepMemError::InvalidJson(e.to_string()))
}

// ============================================================================
// Rate limiting
// ============================================================================

#[derive(Debug)]
struct Window {
    start_ms: u64,
    count: u64,
}

/// Fixed-window counter keyed by `{key_id}:{route}`
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    window_ms: u64,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(enabled: bool, window_ms: u64) -> Self {
        Self {
            windows: DashMap::new(),
            window_ms: window_ms.max(1),
            enabled,
        }
    }

    /// Count one hit; error with a Retry-After once the window is exhausted
    pub fn check(&self, key_id: &str, route: &str, limit: u64) -> Result<()> {
        if !self.enabled || limit == 0 {
            return Ok(());
        }
        let now = now_ms();
        let bucket = format!("{}:{}", key_id, route);
        let mut entry = self.windows.entry(bucket).or_insert(Window {
            start_ms: now,
            count: 0,
        });
        if now.saturating_sub(entry.start_ms) >= self.window_ms {
            entry.start_ms = now;
            entry.count = 0;
        }
        entry.count += 1;
        if entry.count > limit {
            let window_end = entry.start_ms + self.window_ms;
            let retry_after_secs = window_end.saturating_sub(now).div_ceil(1000).max(1);
            return Err(DeepMemError::RateLimited { retry_after_secs });
        }
        Ok(())
    }
}

// ============================================================================
// Backlog shedding
// ============================================================================

/// Outcome of evaluating the layered backlog policies against queue depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogDecision {
    Allow,
    /// Severe backlog: tell the client the index is read-only for now
    ReadOnly { retry_after_secs: u64 },
    /// Hard shed with 503
    Reject { retry_after_secs: u64 },
    /// Accept, but schedule the task into the future
    Delay {
        not_before_ms: u64,
        delay_seconds: u64,
    },
}

impl GuardrailConfig {
    /// Evaluate shedding policies in severity order: read-only, reject, delay
    pub fn backlog_decision(&self, pending: usize) -> BacklogDecision {
        if self.read_only_pending > 0 && pending >= self.read_only_pending {
            return BacklogDecision::ReadOnly {
                retry_after_secs: self.backlog_retry_after_secs,
            };
        }
        if self.reject_pending > 0 && pending >= self.reject_pending {
            return BacklogDecision::Reject {
                retry_after_secs: self.backlog_retry_after_secs,
            };
        }
        if self.delay_pending > 0 && pending >= self.delay_pending {
            return BacklogDecision::Delay {
                not_before_ms: now_ms() + self.backlog_delay_seconds * 1000,
                delay_seconds: self.backlog_delay_seconds,
            };
        }
        BacklogDecision::Allow
    }

    pub fn namespace_write_disabled(&self, namespace: &str) -> bool {
        self.disabled_namespaces.iter().any(|ns| ns == namespace)
    }

    /// Deterministic sampling: the same `(ns, sid, count)` always lands in
    /// the same bucket, so retried requests are not re-rolled
    pub fn sampled_out(&self, namespace: &str, session_id: &str, message_count: usize) -> bool {
        if self.sample_rate >= 1.0 {
            return false;
        }
        sample_bucket(namespace, session_id, message_count) >= self.sample_rate
    }
}

// ============================================================================
// Min-interval throttle
// ============================================================================

/// Per-session update throttle
pub struct UpdateThrottle {
    last_update_ms: DashMap<String, u64>,
    min_interval_ms: u64,
}

impl UpdateThrottle {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            last_update_ms: DashMap::new(),
            min_interval_ms,
        }
    }

    /// Error with a Retry-After while the session is inside its cool-down
    pub fn check(&self, namespace: &str, session_id: &str) -> Result<()> {
        if self.min_interval_ms == 0 {
            return Ok(());
        }
        let key = format!("{}::{}", namespace, session_id);
        if let Some(last) = self.last_update_ms.get(&key) {
            let elapsed = now_ms().saturating_sub(*last);
            if elapsed < self.min_interval_ms {
                let retry_after_secs = (self.min_interval_ms - elapsed).div_ceil(1000).max(1);
                return Err(DeepMemError::RateLimited { retry_after_secs });
            }
        }
        Ok(())
    }

    /// Record an accepted update for the session
    pub fn note(&self, namespace: &str, session_id: &str) {
        if self.min_interval_ms == 0 {
            return;
        }
        let key = format!("{}::{}", namespace, session_id);
        self.last_update_ms.insert(key, now_ms());
    }
}

// ============================================================================
// Per-namespace retrieve concurrency
// ============================================================================

/// Gauge of in-flight retrievals per namespace
pub struct RetrieveGauge {
    active: Arc<DashMap<String, usize>>,
    limit: usize,
}

/// Releases its slot on drop, so early returns cannot leak a slot
pub struct RetrievePermit {
    active: Arc<DashMap<String, usize>>,
    namespace: String,
}

impl RetrieveGauge {
    pub fn new(limit: usize) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            limit,
        }
    }

    pub fn acquire(&self, namespace: &str) -> Result<Option<RetrievePermit>> {
        if self.limit == 0 {
            return Ok(None);
        }
        let mut entry = self.active.entry(namespace.to_string()).or_insert(0);
        if *entry >= self.limit {
            return Err(DeepMemError::NamespaceOverloaded(namespace.to_string()));
        }
        *entry += 1;
        drop(entry);
        Ok(Some(RetrievePermit {
            active: Arc::clone(&self.active),
            namespace: namespace.to_string(),
        }))
    }

    pub fn active_for(&self, namespace: &str) -> usize {
        self.active.get(namespace).map(|v| *v).unwrap_or(0)
    }
}

impl Drop for RetrievePermit {
    fn drop(&mut self) {
        if let Some(mut entry) = self.active.get_mut(&self.namespace) {
            *entry = entry.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_length_check() {
        assert!(check_content_length(None, 100).is_ok());
        assert!(check_content_length(Some(100), 100).is_ok());
        assert!(matches!(
            check_content_length(Some(101), 100),
            Err(DeepMemError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_json_bounds_and_parse() {
        let ok: serde_json::Value = decode_json(br#"{"a":1}"#, 100).unwrap();
        assert_eq!(ok["a"], 1);
        assert!(matches!(
            decode_json::<serde_json::Value>(br#"{"a":1}"#, 3),
            Err(DeepMemError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            decode_json::<serde_json::Value>(b"not json", 100),
            Err(DeepMemError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new(true, 60_000);
        assert!(limiter.check("k1", "retrieve", 2).is_ok());
        assert!(limiter.check("k1", "retrieve", 2).is_ok());
        let err = limiter.check("k1", "retrieve", 2).unwrap_err();
        match err {
            DeepMemError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected rate_limited, got {:?}", other),
        }
        // Distinct key or route gets its own window.
        assert!(limiter.check("k2", "retrieve", 2).is_ok());
        assert!(limiter.check("k1", "update", 2).is_ok());
    }

    #[test]
    fn test_rate_limiter_disabled() {
        let limiter = RateLimiter::new(false, 1000);
        for _ in 0..100 {
            assert!(limiter.check("k1", "retrieve", 1).is_ok());
        }
    }

    #[test]
    fn test_backlog_policy_order() {
        let config = GuardrailConfig {
            read_only_pending: 100,
            reject_pending: 50,
            delay_pending: 10,
            ..Default::default()
        };
        assert_eq!(config.backlog_decision(5), BacklogDecision::Allow);
        assert!(matches!(
            config.backlog_decision(20),
            BacklogDecision::Delay { .. }
        ));
        assert!(matches!(
            config.backlog_decision(60),
            BacklogDecision::Reject { .. }
        ));
        assert!(matches!(
            config.backlog_decision(150),
            BacklogDecision::ReadOnly { .. }
        ));
    }

    #[test]
    fn test_backlog_policies_disabled_by_zero() {
        let config = GuardrailConfig::default();
        assert_eq!(config.backlog_decision(1_000_000), BacklogDecision::Allow);
    }

    #[test]
    fn test_disabled_namespaces() {
        let config = GuardrailConfig {
            disabled_namespaces: vec!["frozen".to_string()],
            ..Default::default()
        };
        assert!(config.namespace_write_disabled("frozen"));
        assert!(!config.namespace_write_disabled("default"));
    }

    #[test]
    fn test_sampling_deterministic() {
        let config = GuardrailConfig {
            sample_rate: 0.5,
            ..Default::default()
        };
        let first = config.sampled_out("ns", "s1", 3);
        for _ in 0..10 {
            assert_eq!(config.sampled_out("ns", "s1", 3), first);
        }
        // Full sampling never drops.
        let full = GuardrailConfig::default();
        assert!(!full.sampled_out("ns", "s1", 3));
    }

    #[test]
    fn test_throttle() {
        let throttle = UpdateThrottle::new(60_000);
        assert!(throttle.check("ns", "s1").is_ok());
        throttle.note("ns", "s1");
        assert!(matches!(
            throttle.check("ns", "s1"),
            Err(DeepMemError::RateLimited { .. })
        ));
        // Other sessions are unaffected.
        assert!(throttle.check("ns", "s2").is_ok());
    }

    #[test]
    fn test_retrieve_gauge_limit_and_release() {
        let gauge = RetrieveGauge::new(2);
        let p1 = gauge.acquire("ns1").unwrap();
        let _p2 = gauge.acquire("ns1").unwrap();
        assert!(matches!(
            gauge.acquire("ns1"),
            Err(DeepMemError::NamespaceOverloaded(_))
        ));
        // Other namespaces have their own budget.
        let _other = gauge.acquire("ns2").unwrap();
        drop(p1);
        assert_eq!(gauge.active_for("ns1"), 1);
        assert!(gauge.acquire("ns1").is_ok());
    }

    #[test]
    fn test_retrieve_gauge_disabled() {
        let gauge = RetrieveGauge::new(0);
        assert!(gauge.acquire("ns1").unwrap().is_none());
    }
}
