//! Safety verdict cache
//!
//! Moderation against a live shield is not deterministic, but a step re-executed on
//! replay must reach the same decision. Verdicts are therefore cached in the run
//! state, keyed by the SHA-256 of the exact content:
//!
//! - a cached `safe` verdict is always reused
//! - a cached `unsafe` verdict is reused unless its category is `system_error`, so
//!   content blocked once is never let through on replay
//! - a `system_error` verdict (the shield itself failed) is re-checked
//!
//! Shield errors fail closed as `unsafe/system_error`. Every fresh verdict is also
//! written to an audit sink; a failing sink is logged and otherwise ignored.

use crate::backends::SafetyShield;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Category given to verdicts produced by a shield failure
pub const SYSTEM_ERROR: &str = "system_error";

/// Hex SHA-256 of `content`
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Safe,
    Unsafe,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Unsafe => "unsafe",
        }
    }
}

/// A cached moderation verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCacheEntry {
    pub content_hash: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub category: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl SafetyCacheEntry {
    pub fn is_safe(&self) -> bool {
        self.verdict == Verdict::Safe
    }

    /// Whether the entry may stand in for a fresh check
    pub fn is_reusable(&self) -> bool {
        match self.verdict {
            Verdict::Safe => true,
            Verdict::Unsafe => self.category.as_deref() != Some(SYSTEM_ERROR),
        }
    }
}

/// Verdicts of one run, keyed by content hash
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SafetyCache {
    entries: BTreeMap<String, SafetyCacheEntry>,
}

impl SafetyCache {
    pub fn get(&self, key: &str) -> Option<&SafetyCacheEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, entry: SafetyCacheEntry) {
        self.entries.insert(entry.content_hash.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Destination for the verdict audit trail
#[async_trait]
pub trait SafetyAuditSink: Send + Sync {
    async fn record(&self, run_id: &str, entry: &SafetyCacheEntry) -> Result<()>;
}

/// Runs content through the shield, consulting the run's cache first
#[derive(Clone)]
pub struct SafetyGuard {
    shield: Arc<dyn SafetyShield>,
    audit: Option<Arc<dyn SafetyAuditSink>>,
}

impl std::fmt::Debug for SafetyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGuard")
            .field("audited", &self.audit.is_some())
            .finish()
    }
}

impl SafetyGuard {
    pub fn new(shield: Arc<dyn SafetyShield>) -> Self {
        Self {
            shield,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn SafetyAuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Verdict for `content`, keyed by its hash
    pub async fn check(
        &self,
        run_id: &str,
        cache: &mut SafetyCache,
        content: &str,
    ) -> SafetyCacheEntry {
        let key = content_hash(content);
        self.guard(run_id, cache, &key, content).await
    }

    /// Verdict for `content` under an explicit cache `key`
    pub async fn guard(
        &self,
        run_id: &str,
        cache: &mut SafetyCache,
        key: &str,
        content: &str,
    ) -> SafetyCacheEntry {
        if let Some(cached) = cache.get(key).filter(|entry| entry.is_reusable()) {
            debug!(
                run_id,
                content_hash = key,
                verdict = cached.verdict.as_str(),
                "Reusing cached verdict"
            );
            return cached.clone();
        }

        let (verdict, category) = match self.shield.moderate(content).await {
            Ok(result) if result.safe => (Verdict::Safe, None),
            Ok(result) => (
                Verdict::Unsafe,
                Some(result.category.unwrap_or_else(|| "unspecified".to_string())),
            ),
            Err(e) => {
                warn!(run_id, error = %e, "Safety shield failed, blocking content");
                (Verdict::Unsafe, Some(SYSTEM_ERROR.to_string()))
            }
        };

        let entry = SafetyCacheEntry {
            content_hash: key.to_string(),
            verdict,
            category,
            checked_at: Utc::now(),
        };
        cache.insert(entry.clone());

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record(run_id, &entry).await {
                warn!(run_id, error = %e, "Failed to record safety verdict");
            }
        }

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedStudio;
    use crate::error::StudioflowError;

    struct BrokenSink;

    #[async_trait]
    impl SafetyAuditSink for BrokenSink {
        async fn record(&self, _run_id: &str, _entry: &SafetyCacheEntry) -> Result<()> {
            Err(StudioflowError::backend("audit", "disk full"))
        }
    }

    fn cached(content: &str, verdict: Verdict, category: Option<&str>) -> SafetyCacheEntry {
        SafetyCacheEntry {
            content_hash: content_hash(content),
            verdict,
            category: category.map(str::to_string),
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_cached_policy_block_survives_replay() {
        let studio = Arc::new(SimulatedStudio::new());
        let guard = SafetyGuard::new(studio.clone());
        let mut cache = SafetyCache::default();
        cache.insert(cached("caption", Verdict::Unsafe, Some("policy")));

        // The shield would now call it safe; the cached block still wins
        let entry = guard.check("run-1", &mut cache, "caption").await;
        assert!(!entry.is_safe());
        assert_eq!(entry.category.as_deref(), Some("policy"));
        assert_eq!(studio.moderation_calls(), 0);
    }

    #[tokio::test]
    async fn test_system_error_is_rechecked() {
        let studio = Arc::new(SimulatedStudio::new());
        let guard = SafetyGuard::new(studio.clone());
        let mut cache = SafetyCache::default();
        cache.insert(cached("caption", Verdict::Unsafe, Some(SYSTEM_ERROR)));

        let entry = guard.check("run-1", &mut cache, "caption").await;
        assert!(entry.is_safe());
        assert_eq!(studio.moderation_calls(), 1);
        assert!(cache.get(&content_hash("caption")).unwrap().is_safe());
    }

    #[tokio::test]
    async fn test_shield_outage_fails_closed() {
        let studio = Arc::new(SimulatedStudio::new());
        studio.set_shield_outage(true);
        let guard = SafetyGuard::new(studio.clone());
        let mut cache = SafetyCache::default();

        let entry = guard.check("run-1", &mut cache, "caption").await;
        assert_eq!(entry.verdict, Verdict::Unsafe);
        assert_eq!(entry.category.as_deref(), Some(SYSTEM_ERROR));
        assert!(!entry.is_reusable());
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_check() {
        let studio = Arc::new(SimulatedStudio::new());
        let guard = SafetyGuard::new(studio).with_audit(Arc::new(BrokenSink));
        let mut cache = SafetyCache::default();

        let entry = guard.check("run-1", &mut cache, "a calm lake").await;
        assert!(entry.is_safe());
        assert_eq!(cache.len(), 1);
    }
}
