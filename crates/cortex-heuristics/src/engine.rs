use std::sync::Arc;

use cortex_core::types::{DepartmentInference, PatternSummary, QueryAnalysis};
use cortex_storage::StorageBackend;
use uuid::Uuid;

use crate::patterns::PatternDetector;

/// Facade over the analyzers: three pure functions and the stateful
/// session pattern detector.
pub struct HeuristicsEngine {
    detector: PatternDetector,
}

impl HeuristicsEngine {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            detector: PatternDetector::new(storage),
        }
    }

    pub fn analyze(&self, text: &str) -> QueryAnalysis {
        crate::complexity::analyze(text)
    }

    pub fn infer_department(
        &self,
        text: &str,
        keywords: &[String],
        configured: &[String],
    ) -> DepartmentInference {
        crate::department::infer(text, keywords, configured)
    }

    pub fn classify_category(&self, text: &str) -> &'static str {
        crate::classify::classify_category(text)
    }

    pub async fn session_pattern(
        &self,
        tenant_id: Uuid,
        user_email: &str,
        session_id: &str,
    ) -> PatternSummary {
        self.detector.detect(tenant_id, user_email, session_id).await
    }
}
