//! Trend & anomaly detection — pure aggregation over recent query records.
//!
//! Callers pass `now` explicitly so the functions stay deterministic and
//! testable; the analytics read APIs feed them records for the last N
//! hours.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Timelike, Utc};
use cortex_core::types::QueryRecord;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentPeak {
    pub department: String,
    pub peak_hour: u32,
    pub queries_in_peak: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergingTopic {
    pub keyword: String,
    pub recent_per_hour: f32,
    pub historical_per_hour: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepeatAnomaly {
    pub department: String,
    pub recent_repeat_rate: f32,
    pub historical_repeat_rate: f32,
}

/// Per-department hour of day with the most queries.
pub fn peak_hours(records: &[QueryRecord]) -> Vec<DepartmentPeak> {
    let mut by_dept: HashMap<&str, BTreeMap<u32, usize>> = HashMap::new();
    for record in records {
        let dept = record.inferred_department.as_str();
        let hour = record.created_at.hour();
        *by_dept.entry(dept).or_default().entry(hour).or_default() += 1;
    }

    let mut out: Vec<DepartmentPeak> = by_dept
        .into_iter()
        .filter_map(|(dept, hours)| {
            hours
                .into_iter()
                // ties break toward the earlier hour (BTreeMap order + strict gt)
                .fold(None::<(u32, usize)>, |best, (hour, count)| match best {
                    Some((_, best_count)) if count <= best_count => best,
                    _ => Some((hour, count)),
                })
                .map(|(peak_hour, queries_in_peak)| DepartmentPeak {
                    department: dept.to_string(),
                    peak_hour,
                    queries_in_peak,
                })
        })
        .collect();
    out.sort_by(|a, b| a.department.cmp(&b.department));
    out
}

/// Keywords whose recent rate is at least 1.5× their historical rate.
///
/// "Recent" is the trailing `recent_hours` before `now`; everything else
/// in `records` is the historical baseline. Keywords never seen in the
/// baseline qualify once they appear at least twice recently.
pub fn emerging_topics(
    records: &[QueryRecord],
    recent_hours: i64,
    now: DateTime<Utc>,
) -> Vec<EmergingTopic> {
    let cutoff = now - chrono::Duration::hours(recent_hours);
    let mut recent: HashMap<&str, usize> = HashMap::new();
    let mut historical: HashMap<&str, usize> = HashMap::new();
    let mut historical_span_hours: f32 = 0.0;

    let oldest = records.iter().map(|r| r.created_at).min();
    if let Some(oldest) = oldest {
        let span = (cutoff - oldest).num_minutes() as f32 / 60.0;
        historical_span_hours = span.max(1.0);
    }

    for record in records {
        let bucket = if record.created_at >= cutoff {
            &mut recent
        } else {
            &mut historical
        };
        for kw in &record.keywords {
            *bucket.entry(kw.as_str()).or_default() += 1;
        }
    }

    let mut out: Vec<EmergingTopic> = recent
        .into_iter()
        .filter_map(|(kw, count)| {
            let recent_rate = count as f32 / recent_hours.max(1) as f32;
            let historical_rate =
                historical.get(kw).copied().unwrap_or(0) as f32 / historical_span_hours;
            let qualifies = if historical_rate == 0.0 {
                count >= 2
            } else {
                recent_rate >= 1.5 * historical_rate
            };
            qualifies.then(|| EmergingTopic {
                keyword: kw.to_string(),
                recent_per_hour: recent_rate,
                historical_per_hour: historical_rate,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        b.recent_per_hour
            .total_cmp(&a.recent_per_hour)
            .then(a.keyword.cmp(&b.keyword))
    });
    out
}

/// Departments whose recent repeat-question rate is at least 2× the
/// historical rate.
pub fn repeat_anomalies(
    records: &[QueryRecord],
    recent_hours: i64,
    now: DateTime<Utc>,
) -> Vec<RepeatAnomaly> {
    let cutoff = now - chrono::Duration::hours(recent_hours);
    // (repeats, total) per department, split recent/historical
    let mut recent: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut historical: HashMap<&str, (usize, usize)> = HashMap::new();

    for record in records {
        let bucket = if record.created_at >= cutoff {
            &mut recent
        } else {
            &mut historical
        };
        let entry = bucket.entry(record.inferred_department.as_str()).or_default();
        entry.1 += 1;
        if record.is_repeat {
            entry.0 += 1;
        }
    }

    let mut out: Vec<RepeatAnomaly> = recent
        .into_iter()
        .filter_map(|(dept, (repeats, total))| {
            if total == 0 || repeats == 0 {
                return None;
            }
            let recent_rate = repeats as f32 / total as f32;
            let historical_rate = historical
                .get(dept)
                .filter(|(_, t)| *t > 0)
                .map(|(r, t)| *r as f32 / *t as f32)
                .unwrap_or(0.0);
            let qualifies = if historical_rate == 0.0 {
                repeats >= 2
            } else {
                recent_rate >= 2.0 * historical_rate
            };
            qualifies.then(|| RepeatAnomaly {
                department: dept.to_string(),
                recent_repeat_rate: recent_rate,
                historical_repeat_rate: historical_rate,
            })
        })
        .collect();
    out.sort_by(|a, b| a.department.cmp(&b.department));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::types::{QueryIntent, QueryStatus, SessionPattern, Urgency};
    use uuid::Uuid;

    fn record(
        dept: &str,
        keywords: &[&str],
        is_repeat: bool,
        age_hours: i64,
        now: DateTime<Utc>,
    ) -> QueryRecord {
        QueryRecord {
            id: Uuid::now_v7(),
            tenant_id: Uuid::new_v4(),
            user_email: "u@example.com".into(),
            department: None,
            session_id: "s".into(),
            query_text: "q".into(),
            status: QueryStatus::Completed,
            response_time_ms: 100,
            response_length: 10,
            tokens_in: 1,
            tokens_out: 2,
            model: "m".into(),
            category: "lookup".into(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            frustration_signals: 0,
            is_repeat,
            repeat_of: None,
            query_position_in_session: 1,
            time_since_last_query_ms: None,
            complexity_score: 0.2,
            intent: QueryIntent::InfoSeek,
            specificity: 0.1,
            urgency: Urgency::Low,
            multi_part: false,
            inferred_department: dept.to_string(),
            department_distribution: Default::default(),
            session_pattern: SessionPattern::SingleQuery,
            created_at: now - chrono::Duration::hours(age_hours),
        }
    }

    #[test]
    fn peak_hours_pick_the_busiest_hour() {
        let now = Utc::now();
        let base = now.date_naive().and_hms_opt(9, 0, 0).unwrap().and_utc();
        let mut records = Vec::new();
        for _ in 0..3 {
            let mut r = record("it", &[], false, 0, base);
            r.created_at = base;
            records.push(r);
        }
        let mut r = record("it", &[], false, 0, base);
        r.created_at = base + chrono::Duration::hours(2);
        records.push(r);

        let peaks = peak_hours(&records);
        assert_eq!(peaks.len(), 1);
        assert_eq!(peaks[0].peak_hour, 9);
        assert_eq!(peaks[0].queries_in_peak, 3);
    }

    #[test]
    fn emerging_topic_requires_1_5x_baseline() {
        let now = Utc::now();
        let mut records = Vec::new();
        // historical: "vpn" once over ~24h of baseline
        records.push(record("it", &["vpn"], false, 30, now));
        // recent: "vpn" four times within the window
        for _ in 0..4 {
            records.push(record("it", &["vpn"], false, 1, now));
        }
        let topics = emerging_topics(&records, 4, now);
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].keyword, "vpn");
        assert!(topics[0].recent_per_hour >= 1.5 * topics[0].historical_per_hour);
    }

    #[test]
    fn steady_topic_is_not_emerging() {
        let now = Utc::now();
        let mut records = Vec::new();
        for age in [30, 28, 26] {
            records.push(record("it", &["printer"], false, age, now));
        }
        records.push(record("it", &["printer"], false, 2, now));
        let topics = emerging_topics(&records, 24, now);
        assert!(topics.is_empty(), "got {:?}", topics);
    }

    #[test]
    fn repeat_anomaly_requires_2x_baseline() {
        let now = Utc::now();
        let mut records = Vec::new();
        // historical rate: 1/10
        records.push(record("logistics", &[], true, 30, now));
        for _ in 0..9 {
            records.push(record("logistics", &[], false, 30, now));
        }
        // recent rate: 3/5
        for _ in 0..3 {
            records.push(record("logistics", &[], true, 1, now));
        }
        for _ in 0..2 {
            records.push(record("logistics", &[], false, 1, now));
        }
        let anomalies = repeat_anomalies(&records, 4, now);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].department, "logistics");
    }
}
