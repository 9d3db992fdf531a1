use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use cortex_core::CortexError;
use cortex_tenants::profile::AuthMethod;
use serde::Deserialize;
use tracing::info;

use crate::app::{ApiError, AppState};

/// Auth callback body: either an IdP authorization code (enterprise) or
/// email+password (consumer tenants with the password method enabled).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CallbackBody {
    Code { code: String, state: Option<String> },
    Password { email: String, password: String },
}

/// POST /api/auth/callback — exchanges IdP credentials for a session
/// token. 401 on any invalid state/code; details stay in the logs.
pub async fn callback_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CallbackBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = state.tenant_for(&headers);

    let token = match body {
        CallbackBody::Code { code, .. } => {
            if !tenant.auth_methods.contains(&AuthMethod::OidcEnterprise)
                && !tenant.auth_methods.contains(&AuthMethod::OidcConsumer)
            {
                return Err(CortexError::Unauthenticated("oidc not enabled".into()).into());
            }
            let access_token = state
                .auth
                .exchange_code(&code)
                .await
                .map_err(CortexError::from)?;
            let principal = state
                .auth
                .authenticate(&access_token, tenant.id, tenant.mode)
                .await
                .map_err(CortexError::from)?;
            info!(user_id = %principal.user_id, tenant = %tenant.slug, "oidc login");
            state.auth.issue_session(principal.user_id)
        }
        CallbackBody::Password { email, password } => {
            if !tenant.auth_methods.contains(&AuthMethod::Password) {
                return Err(CortexError::Unauthenticated("password login not enabled".into()).into());
            }
            let token = state
                .auth
                .login_password(tenant.id, &email, &password)
                .map_err(CortexError::from)?;
            info!(tenant = %tenant.slug, "password login");
            token
        }
    };

    Ok(Json(serde_json::json!({ "token": token })))
}
