use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use cortex_tenants::SanitizedProfile;

use crate::app::AppState;

/// GET /api/tenant/config — the sanitized profile for the request host.
/// Unknown hosts fall back to the consumer profile, so this never 404s.
pub async fn config_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<SanitizedProfile> {
    let tenant = state.tenant_for(&headers);
    Json(tenant.sanitized())
}
