use std::sync::Arc;

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use cortex_agent::CognitivePipeline;
use cortex_analytics::AnalyticsReports;
use cortex_core::config::CortexConfig;
use cortex_core::types::Principal;
use cortex_core::CortexError;
use cortex_identity::{Authenticator, UserStore};
use cortex_memory::MemoryHandle;
use cortex_storage::StorageBackend;
use cortex_tenants::{TenantProfile, TenantResolver};

use crate::ratelimit::RateLimiter;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CortexConfig,
    pub tenants: TenantResolver,
    pub users: Arc<UserStore>,
    pub auth: Authenticator,
    pub storage: Arc<dyn StorageBackend>,
    pub pipeline: CognitivePipeline,
    pub reports: AnalyticsReports,
    pub memory: MemoryHandle,
    pub rate: RateLimiter,
}

impl AppState {
    /// Tenant profile for the request's Host header (falls back to the
    /// consumer profile; never errors).
    pub fn tenant_for(&self, headers: &HeaderMap) -> Arc<TenantProfile> {
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        self.tenants.resolve(host)
    }

    /// Authenticate the bearer token against the request's tenant.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        tenant: &TenantProfile,
    ) -> Result<Principal, CortexError> {
        let bearer = bearer_token(headers)
            .ok_or_else(|| CortexError::Unauthenticated("missing bearer token".into()))?;
        let principal = self
            .auth
            .authenticate(bearer, tenant.id, tenant.mode)
            .await?;
        Ok(principal)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Taxonomy error → HTTP response with a stable error code body.
pub struct ApiError(pub CortexError);

impl From<CortexError> for ApiError {
    fn from(err: CortexError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.0.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        // Internal detail stays in the logs; clients get code + summary.
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "code": self.0.code(),
            "message": client_message(&self.0),
        });
        (status, axum::Json(body)).into_response()
    }
}

fn client_message(err: &CortexError) -> String {
    match err {
        CortexError::Forbidden { action } => format!("not permitted: {}", action),
        CortexError::Unauthenticated(_) => "authentication required".to_string(),
        CortexError::BackendConflict { .. } => "conflict".to_string(),
        CortexError::BackendUnavailable(_) => "temporarily unavailable".to_string(),
        _ => "request failed".to_string(),
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws/chat", get(crate::ws::chat::ws_handler))
        .route("/api/tenant/config", get(crate::http::tenant::config_handler))
        .route("/api/auth/callback", post(crate::http::auth::callback_handler))
        .route("/api/admin/users", get(crate::http::admin::list_users))
        .route("/api/admin/users/{id}", put(crate::http::admin::update_user))
        .route(
            "/api/admin/users/{id}",
            delete(crate::http::admin::deactivate_user),
        )
        .route(
            "/api/admin/users/{id}/reactivate",
            post(crate::http::admin::reactivate_user),
        )
        .route("/api/admin/audit", get(crate::http::admin::audit_log))
        .route(
            "/api/admin/analytics/{report}",
            get(crate::http::admin::analytics_report),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
}
