//! Session pattern detector.
//!
//! The one stateful analyzer: it reads the session's recent query records
//! through the storage backend and caches the classification per
//! (user, session) for a short TTL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cortex_core::types::{PatternSummary, QueryRecord, SessionPattern};
use cortex_storage::StorageBackend;
use tracing::debug;
use uuid::Uuid;

const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_MAX: usize = 1000;
/// Fraction of entries evicted when the cache overflows.
const EVICT_FRACTION: usize = 10;
/// How many recent queries inform the classification.
const LOOKBACK: usize = 20;

struct CachedPattern {
    summary: PatternSummary,
    computed_at: Instant,
}

pub struct PatternDetector {
    storage: Arc<dyn StorageBackend>,
    cache: Mutex<HashMap<(String, String), CachedPattern>>,
}

impl PatternDetector {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn detect(
        &self,
        tenant_id: Uuid,
        user_email: &str,
        session_id: &str,
    ) -> PatternSummary {
        let key = (user_email.to_string(), session_id.to_string());
        if let Some(cached) = self.cache_get(&key) {
            return cached;
        }

        let records = self
            .storage
            .recent_session_queries(tenant_id, user_email, session_id, LOOKBACK)
            .await
            .unwrap_or_default();
        let summary = classify(&records);
        self.cache_put(key, summary.clone());
        summary
    }

    fn cache_get(&self, key: &(String, String)) -> Option<PatternSummary> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(key)?;
        if entry.computed_at.elapsed() < CACHE_TTL {
            debug!(session = %key.1, "pattern cache hit");
            Some(entry.summary.clone())
        } else {
            None
        }
    }

    fn cache_put(&self, key: (String, String), summary: PatternSummary) {
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= CACHE_MAX {
            // Evict the oldest tenth to amortize the cleanup.
            let mut entries: Vec<((String, String), Instant)> = cache
                .iter()
                .map(|(k, v)| (k.clone(), v.computed_at))
                .collect();
            entries.sort_by_key(|(_, at)| *at);
            for (k, _) in entries.into_iter().take(CACHE_MAX / EVICT_FRACTION) {
                cache.remove(&k);
            }
        }
        cache.insert(
            key,
            CachedPattern {
                summary,
                computed_at: Instant::now(),
            },
        );
    }
}

/// Pure classification over the session's recent records.
///
/// Checked in order of signal strength: escalation (frustration/repeats),
/// onboarding (procedural share), focus (category concentration),
/// exploration (category diversity), otherwise mixed.
pub fn classify(records: &[QueryRecord]) -> PatternSummary {
    let query_count = records.len();
    if query_count <= 1 {
        return PatternSummary {
            pattern: SessionPattern::SingleQuery,
            confidence: 1.0,
            query_count,
            details: BTreeMap::new(),
        };
    }

    let frustration: u32 = records.iter().map(|r| r.frustration_signals).sum();
    let repeats = records.iter().filter(|r| r.is_repeat).count();
    let procedural = records.iter().filter(|r| r.category == "how_to").count();

    let mut by_category: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *by_category.entry(record.category.as_str()).or_default() += 1;
    }
    let distinct = by_category.len();
    let max_share = by_category
        .values()
        .map(|&c| c as f32 / query_count as f32)
        .fold(0.0f32, f32::max);
    let diversity = distinct as f32 / query_count as f32;
    let procedural_share = procedural as f32 / query_count as f32;

    let mut details = BTreeMap::new();
    details.insert("diversity".to_string(), diversity);
    details.insert("concentration".to_string(), max_share);
    details.insert("procedural_share".to_string(), procedural_share);
    details.insert("frustration".to_string(), frustration as f32);
    details.insert("repeats".to_string(), repeats as f32);

    let (pattern, confidence) = if frustration >= 2 || repeats >= 3 {
        (
            SessionPattern::TroubleshootingEscalation,
            (frustration.max(repeats as u32) as f32 / query_count as f32).min(1.0),
        )
    } else if procedural_share >= 0.6 {
        (SessionPattern::Onboarding, procedural_share)
    } else if max_share >= 0.7 {
        (SessionPattern::Focused, max_share)
    } else if diversity >= 0.6 {
        (SessionPattern::Exploratory, diversity)
    } else {
        (SessionPattern::Mixed, 0.5)
    };

    PatternSummary {
        pattern,
        confidence,
        query_count,
        details,
    }
}
