use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated (user, tenant, grants) triple carried with each request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub departments: BTreeSet<String>,
    pub dept_head_for: BTreeSet<String>,
    pub is_super_user: bool,
}

/// Tenant operating mode. Consumer tenants scope memory per user;
/// enterprise tenants scope it per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantMode {
    Consumer,
    Enterprise,
}

/// The scope under which a storage query executes.
///
/// Fail-secure: a `Departments` scope with an empty set matches nothing,
/// and backends must return empty results without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Scope {
    User {
        user_id: Uuid,
    },
    Tenant {
        tenant_id: Uuid,
    },
    Departments {
        tenant_id: Uuid,
        department_ids: BTreeSet<String>,
    },
}

impl Scope {
    /// True when the scope can never match any row.
    pub fn is_empty(&self) -> bool {
        match self {
            Scope::Departments { department_ids, .. } => department_ids.is_empty(),
            _ => false,
        }
    }
}

/// Immutable piece of tenant knowledge, produced by external ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub department_id: String,
    pub source_file: String,
    /// SHA-256 of the source file, hex encoded.
    pub file_hash: String,
    pub section_title: String,
    pub content: String,
    pub chunk_index: u32,
    pub parent_document_id: Option<Uuid>,
    pub token_count: u32,
    pub keywords: Vec<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub enrichment: Option<ChunkEnrichment>,
    pub created_at: DateTime<Utc>,
}

/// Optional enrichment attached by the ingestion pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkEnrichment {
    pub synthetic_questions: Vec<String>,
    pub question_embedding: Option<Vec<f32>>,
    pub complexity_score: Option<f32>,
    pub intent_tags: Vec<String>,
    /// Importance used as a tie-breaker in retrieval ordering.
    pub importance: f32,
    /// Graph edges to chunks that should be read first.
    pub prerequisites: Vec<Uuid>,
}

/// Origin of a memory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Chat,
    Voice,
    Import,
}

impl std::fmt::Display for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemorySource::Chat => "chat",
            MemorySource::Voice => "voice",
            MemorySource::Import => "import",
        };
        f.write_str(s)
    }
}

impl FromStr for MemorySource {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(MemorySource::Chat),
            "voice" => Ok(MemorySource::Voice),
            "import" => Ok(MemorySource::Import),
            _ => Err(()),
        }
    }
}

/// One human/assistant exchange pair attributable to a user or tenant.
///
/// Exactly one of `user_id` / `tenant_id` is the canonical scope key.
/// Nodes with neither set are never returned by any backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub conversation_id: Uuid,
    pub sequence_index: u32,
    pub human_content: String,
    pub assistant_content: String,
    pub source: MemorySource,
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MemoryNode {
    /// The canonical scope key, or None for malformed nodes (fail-secure:
    /// such nodes are dropped, never broadened).
    pub fn scope_key(&self) -> Option<Scope> {
        match (self.user_id, self.tenant_id) {
            (Some(user_id), _) => Some(Scope::User { user_id }),
            (None, Some(tenant_id)) => Some(Scope::Tenant { tenant_id }),
            (None, None) => None,
        }
    }
}

/// A coarser aggregation of memory nodes representing a conversation arc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicMemory {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub conversation_id: Uuid,
    pub messages: Vec<String>,
    pub summary: String,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

// ── heuristics outputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    InfoSeek,
    Action,
    Decision,
    Verify,
}

impl std::fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryIntent::InfoSeek => "info_seek",
            QueryIntent::Action => "action",
            QueryIntent::Decision => "decision",
            QueryIntent::Verify => "verify",
        };
        f.write_str(s)
    }
}

impl FromStr for QueryIntent {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info_seek" => Ok(QueryIntent::InfoSeek),
            "action" => Ok(QueryIntent::Action),
            "decision" => Ok(QueryIntent::Decision),
            "verify" => Ok(QueryIntent::Verify),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Urgent,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl FromStr for Urgency {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Urgency::Low),
            "medium" => Ok(Urgency::Medium),
            "high" => Ok(Urgency::High),
            "urgent" => Ok(Urgency::Urgent),
            _ => Err(()),
        }
    }
}

/// Output of the complexity analyzer. All scores are in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub complexity_score: f32,
    pub intent: QueryIntent,
    pub specificity: f32,
    pub urgency: Urgency,
    pub multi_part: bool,
}

/// Output of the department context analyzer. `distribution` sums to 1.0
/// when at least one signal matched; otherwise it is empty and `primary`
/// is "general".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentInference {
    pub primary: String,
    pub distribution: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPattern {
    Exploratory,
    Focused,
    TroubleshootingEscalation,
    Onboarding,
    Mixed,
    SingleQuery,
}

impl std::fmt::Display for SessionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionPattern::Exploratory => "exploratory",
            SessionPattern::Focused => "focused",
            SessionPattern::TroubleshootingEscalation => "troubleshooting_escalation",
            SessionPattern::Onboarding => "onboarding",
            SessionPattern::Mixed => "mixed",
            SessionPattern::SingleQuery => "single_query",
        };
        f.write_str(s)
    }
}

impl FromStr for SessionPattern {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exploratory" => Ok(SessionPattern::Exploratory),
            "focused" => Ok(SessionPattern::Focused),
            "troubleshooting_escalation" => Ok(SessionPattern::TroubleshootingEscalation),
            "onboarding" => Ok(SessionPattern::Onboarding),
            "mixed" => Ok(SessionPattern::Mixed),
            "single_query" => Ok(SessionPattern::SingleQuery),
            _ => Err(()),
        }
    }
}

/// Output of the session pattern detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSummary {
    pub pattern: SessionPattern,
    pub confidence: f32,
    pub query_count: usize,
    pub details: BTreeMap<String, f32>,
}

// ── analytics records ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Completed,
    Canceled,
    Failed,
    FailedMidstream,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryStatus::Completed => "completed",
            QueryStatus::Canceled => "canceled",
            QueryStatus::Failed => "failed",
            QueryStatus::FailedMidstream => "failed_midstream",
        };
        f.write_str(s)
    }
}

impl FromStr for QueryStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(QueryStatus::Completed),
            "canceled" => Ok(QueryStatus::Canceled),
            "failed" => Ok(QueryStatus::Failed),
            "failed_midstream" => Ok(QueryStatus::FailedMidstream),
            _ => Err(()),
        }
    }
}

/// One record per user query, written after the exchange completes (or
/// fails, or is canceled). The heuristics outputs ride along so the
/// analytics read APIs can aggregate without re-analyzing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_email: String,
    pub department: Option<String>,
    pub session_id: String,
    /// Truncated to the configured max; retrieval and the LLM see the
    /// full text.
    pub query_text: String,
    pub status: QueryStatus,
    pub response_time_ms: u64,
    pub response_length: u32,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub model: String,
    /// Cheap regex classifier output (e.g. "how_to", "troubleshooting").
    pub category: String,
    pub keywords: Vec<String>,
    pub frustration_signals: u32,
    pub is_repeat: bool,
    pub repeat_of: Option<Uuid>,
    pub query_position_in_session: u32,
    pub time_since_last_query_ms: Option<u64>,
    pub complexity_score: f32,
    pub intent: QueryIntent,
    pub specificity: f32,
    pub urgency: Urgency,
    pub multi_part: bool,
    pub inferred_department: String,
    pub department_distribution: BTreeMap<String, f32>,
    pub session_pattern: SessionPattern,
    pub created_at: DateTime<Utc>,
}

/// Fire-and-forget metric events. Unlike QueryRecords these may be dropped
/// under back-pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MetricEvent {
    QueryStart {
        query_id: Uuid,
        tenant_id: Uuid,
        at: DateTime<Utc>,
    },
    QueryFinish {
        query_id: Uuid,
        status: QueryStatus,
        at: DateTime<Utc>,
    },
    RetrievalLatency {
        query_id: Uuid,
        ms: u64,
        degraded: bool,
    },
    LlmLatency {
        query_id: Uuid,
        first_token_ms: u64,
        total_ms: u64,
    },
    TokenCounts {
        query_id: Uuid,
        tokens_in: u32,
        tokens_out: u32,
    },
    Error {
        query_id: Option<Uuid>,
        code: String,
    },
}

/// Append-only record of a privileged action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub actor_id: Uuid,
    pub target_id: Option<Uuid>,
    pub action: String,
    pub department: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_department_scope_is_empty() {
        let scope = Scope::Departments {
            tenant_id: Uuid::new_v4(),
            department_ids: BTreeSet::new(),
        };
        assert!(scope.is_empty());

        let scope = Scope::User {
            user_id: Uuid::new_v4(),
        };
        assert!(!scope.is_empty());
    }

    #[test]
    fn node_scope_key_prefers_user() {
        let node = MemoryNode {
            id: Uuid::new_v4(),
            user_id: Some(Uuid::new_v4()),
            tenant_id: Some(Uuid::new_v4()),
            conversation_id: Uuid::new_v4(),
            sequence_index: 0,
            human_content: "q".into(),
            assistant_content: "a".into(),
            source: MemorySource::Chat,
            embedding: None,
            tags: vec![],
            created_at: Utc::now(),
        };
        assert!(matches!(node.scope_key(), Some(Scope::User { .. })));
    }

    #[test]
    fn node_without_scope_has_no_key() {
        let node = MemoryNode {
            id: Uuid::new_v4(),
            user_id: None,
            tenant_id: None,
            conversation_id: Uuid::new_v4(),
            sequence_index: 0,
            human_content: "q".into(),
            assistant_content: "a".into(),
            source: MemorySource::Chat,
            embedding: None,
            tags: vec![],
            created_at: Utc::now(),
        };
        assert!(node.scope_key().is_none());
    }

    #[test]
    fn enum_round_trips() {
        for v in [
            QueryStatus::Completed,
            QueryStatus::Canceled,
            QueryStatus::Failed,
            QueryStatus::FailedMidstream,
        ] {
            assert_eq!(v.to_string().parse::<QueryStatus>().unwrap(), v);
        }
        for v in [Urgency::Low, Urgency::Medium, Urgency::High, Urgency::Urgent] {
            assert_eq!(v.to_string().parse::<Urgency>().unwrap(), v);
        }
    }

    #[test]
    fn urgency_orders_by_severity() {
        assert!(Urgency::Urgent > Urgency::High);
        assert!(Urgency::High > Urgency::Medium);
        assert!(Urgency::Medium > Urgency::Low);
    }
}
