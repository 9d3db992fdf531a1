//! Aggregate read APIs over the query log. Everything is computed from
//! `queries_since` so both storage backends serve the same reports.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cortex_core::types::{QueryRecord, QueryStatus};
use cortex_heuristics::trends;
use cortex_storage::StorageBackend;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub total_queries: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub unique_users: usize,
    pub avg_response_time_ms: f64,
    pub avg_tokens_out: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemporalPatterns {
    pub peak_hours: Vec<trends::DepartmentPeak>,
    pub emerging_topics: Vec<trends::EmergingTopic>,
    pub repeat_anomalies: Vec<trends::RepeatAnomaly>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub query_id: Uuid,
    pub status: QueryStatus,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

pub struct AnalyticsReports {
    storage: Arc<dyn StorageBackend>,
}

impl AnalyticsReports {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    async fn window(&self, tenant_id: Uuid, hours: i64) -> cortex_core::Result<Vec<QueryRecord>> {
        let since = Utc::now() - Duration::hours(hours);
        Ok(self.storage.queries_since(tenant_id, since).await?)
    }

    pub async fn overview(&self, tenant_id: Uuid, hours: i64) -> cortex_core::Result<Overview> {
        let records = self.window(tenant_id, hours).await?;
        let total = records.len();
        let completed = records
            .iter()
            .filter(|r| r.status == QueryStatus::Completed)
            .count();
        let failed = records
            .iter()
            .filter(|r| {
                matches!(r.status, QueryStatus::Failed | QueryStatus::FailedMidstream)
            })
            .count();
        let canceled = records
            .iter()
            .filter(|r| r.status == QueryStatus::Canceled)
            .count();
        let unique_users = records
            .iter()
            .map(|r| r.user_email.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        let avg = |f: fn(&QueryRecord) -> f64| {
            if total == 0 {
                0.0
            } else {
                records.iter().map(f).sum::<f64>() / total as f64
            }
        };
        Ok(Overview {
            total_queries: total,
            completed,
            failed,
            canceled,
            unique_users,
            avg_response_time_ms: avg(|r| r.response_time_ms as f64),
            avg_tokens_out: avg(|r| r.tokens_out as f64),
        })
    }

    /// Hour buckets in "YYYY-MM-DDTHH" form, ascending.
    pub async fn queries_by_hour(
        &self,
        tenant_id: Uuid,
        hours: i64,
    ) -> cortex_core::Result<BTreeMap<String, usize>> {
        let records = self.window(tenant_id, hours).await?;
        let mut buckets = BTreeMap::new();
        for record in records {
            let key = record.created_at.format("%Y-%m-%dT%H").to_string();
            *buckets.entry(key).or_default() += 1;
        }
        Ok(buckets)
    }

    pub async fn category_breakdown(
        &self,
        tenant_id: Uuid,
        hours: i64,
    ) -> cortex_core::Result<BTreeMap<String, usize>> {
        let records = self.window(tenant_id, hours).await?;
        Ok(count_by(&records, |r| r.category.clone()))
    }

    pub async fn intent_breakdown(
        &self,
        tenant_id: Uuid,
        hours: i64,
    ) -> cortex_core::Result<BTreeMap<String, usize>> {
        let records = self.window(tenant_id, hours).await?;
        Ok(count_by(&records, |r| r.intent.to_string()))
    }

    pub async fn urgency_breakdown(
        &self,
        tenant_id: Uuid,
        hours: i64,
    ) -> cortex_core::Result<BTreeMap<String, usize>> {
        let records = self.window(tenant_id, hours).await?;
        Ok(count_by(&records, |r| r.urgency.to_string()))
    }

    /// Complexity histogram over five equal buckets of [0, 1].
    pub async fn complexity_distribution(
        &self,
        tenant_id: Uuid,
        hours: i64,
    ) -> cortex_core::Result<BTreeMap<String, usize>> {
        let records = self.window(tenant_id, hours).await?;
        let mut buckets: BTreeMap<String, usize> = BTreeMap::new();
        for record in records {
            let idx = ((record.complexity_score * 5.0) as usize).min(4);
            let label = format!("{:.1}-{:.1}", idx as f32 * 0.2, (idx + 1) as f32 * 0.2);
            *buckets.entry(label).or_default() += 1;
        }
        Ok(buckets)
    }

    pub async fn department_usage(
        &self,
        tenant_id: Uuid,
        hours: i64,
    ) -> cortex_core::Result<BTreeMap<String, usize>> {
        let records = self.window(tenant_id, hours).await?;
        Ok(count_by(&records, |r| r.inferred_department.clone()))
    }

    pub async fn temporal_patterns(
        &self,
        tenant_id: Uuid,
        hours: i64,
    ) -> cortex_core::Result<TemporalPatterns> {
        let records = self.window(tenant_id, hours).await?;
        let now = Utc::now();
        // "Recent" is the last quarter of the window, floor one hour.
        let recent_hours = (hours / 4).max(1);
        Ok(TemporalPatterns {
            peak_hours: trends::peak_hours(&records),
            emerging_topics: trends::emerging_topics(&records, recent_hours, now),
            repeat_anomalies: trends::repeat_anomalies(&records, recent_hours, now),
        })
    }

    pub async fn recent_errors(
        &self,
        tenant_id: Uuid,
        hours: i64,
        limit: usize,
    ) -> cortex_core::Result<Vec<RecentError>> {
        let records = self.window(tenant_id, hours).await?;
        let mut errors: Vec<RecentError> = records
            .into_iter()
            .filter(|r| {
                matches!(r.status, QueryStatus::Failed | QueryStatus::FailedMidstream)
            })
            .map(|r| RecentError {
                query_id: r.id,
                status: r.status,
                category: r.category,
                created_at: r.created_at,
            })
            .collect();
        errors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        errors.truncate(limit);
        Ok(errors)
    }
}

fn count_by(records: &[QueryRecord], key: impl Fn(&QueryRecord) -> String) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for record in records {
        *out.entry(key(record)).or_default() += 1;
    }
    out
}
