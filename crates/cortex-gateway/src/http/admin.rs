use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use cortex_core::types::{AuditEntry, Principal};
use cortex_core::CortexError;
use cortex_identity::predicates;
use cortex_identity::types::{User, UserUpdate};
use serde::Deserialize;
use uuid::Uuid;

use crate::app::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub department: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_limit() -> usize {
    50
}
fn default_hours() -> i64 {
    24
}

/// Public projection of a user row for admin responses (no password hash).
fn user_view(user: &User) -> serde_json::Value {
    serde_json::json!({
        "id": user.id,
        "email": user.email,
        "display_name": user.display_name,
        "department_access": user.department_access,
        "dept_head_for": user.dept_head_for,
        "is_super_user": user.is_super_user,
        "is_active": user.is_active,
        "last_login_at": user.last_login_at,
    })
}

async fn admin_context(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Arc<cortex_tenants::TenantProfile>, Principal), CortexError> {
    let tenant = state.tenant_for(headers);
    let principal = state.authenticate(headers, &tenant).await?;
    Ok((tenant, principal))
}

/// Whether `actor` may administer `target`. Super users manage anyone;
/// dept heads manage other users whose entire access set falls under
/// departments the actor heads.
fn may_manage(actor: &Principal, target: &User, touched: &BTreeSet<String>) -> bool {
    if actor.is_super_user {
        return true;
    }
    if target.id == actor.user_id {
        return false;
    }
    let mut involved: BTreeSet<&String> = target.department_access.iter().collect();
    involved.extend(touched.iter());
    !involved.is_empty()
        && involved
            .iter()
            .all(|dept| predicates::can_manage_user(actor, target.id, dept))
}

/// GET /api/admin/users?department=&search=
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let (_tenant, principal) = admin_context(&state, &headers).await?;

    let allowed = principal.is_super_user
        || query
            .department
            .as_deref()
            .is_some_and(|dept| predicates::can_write_department(&principal, dept));
    predicates::require(allowed, "users.list")?;

    let users = state
        .users
        .list(
            principal.tenant_id,
            query.department.as_deref(),
            query.search.as_deref(),
        )
        .map_err(CortexError::from)?;
    Ok(Json(users.iter().map(user_view).collect()))
}

/// PUT /api/admin/users/{id}
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(patch): Json<UserUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_tenant, principal) = admin_context(&state, &headers).await?;
    let target = load_target(&state, &principal, id)?;

    // Only super users may mint super users.
    if patch.is_super_user.is_some() {
        predicates::require(principal.is_super_user, "users.grant_super")?;
    }
    let mut touched: BTreeSet<String> = BTreeSet::new();
    if let Some(access) = &patch.department_access {
        touched.extend(access.iter().cloned());
    }
    if let Some(heads) = &patch.dept_head_for {
        touched.extend(heads.iter().cloned());
    }
    predicates::require(may_manage(&principal, &target, &touched), "users.update")?;

    let before = user_view(&target);
    let updated = state.users.update(id, &patch).map_err(CortexError::from)?;
    write_audit(
        &state,
        &principal,
        Some(id),
        "users.update",
        Some(before),
        Some(user_view(&updated)),
    )
    .await;
    Ok(Json(user_view(&updated)))
}

/// DELETE /api/admin/users/{id} — soft delete. Self-deletion is 409.
pub async fn deactivate_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_tenant, principal) = admin_context(&state, &headers).await?;
    let target = load_target(&state, &principal, id)?;

    if id == principal.user_id {
        // A principal may never deactivate itself.
        return Err(CortexError::BackendConflict {
            code: "SELF_DEACTIVATE".into(),
        }
        .into());
    }
    let allowed = predicates::can_deactivate(&principal, id)
        || may_manage(&principal, &target, &BTreeSet::new());
    predicates::require(allowed, "users.deactivate")?;

    let before = user_view(&target);
    let updated = state
        .users
        .set_active(id, false)
        .map_err(CortexError::from)?;
    write_audit(
        &state,
        &principal,
        Some(id),
        "users.deactivate",
        Some(before),
        Some(user_view(&updated)),
    )
    .await;
    Ok(Json(user_view(&updated)))
}

/// POST /api/admin/users/{id}/reactivate
pub async fn reactivate_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_tenant, principal) = admin_context(&state, &headers).await?;
    let target = load_target(&state, &principal, id)?;

    predicates::require(
        may_manage(&principal, &target, &BTreeSet::new()),
        "users.reactivate",
    )?;

    let before = user_view(&target);
    let updated = state
        .users
        .set_active(id, true)
        .map_err(CortexError::from)?;
    write_audit(
        &state,
        &principal,
        Some(id),
        "users.reactivate",
        Some(before),
        Some(user_view(&updated)),
    )
    .await;
    Ok(Json(user_view(&updated)))
}

/// GET /api/admin/audit?limit=&offset=
pub async fn audit_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let (_tenant, principal) = admin_context(&state, &headers).await?;
    predicates::require(principal.is_super_user, "audit.read")?;

    let entries = state
        .storage
        .audit_entries(principal.tenant_id, page.limit.min(500), page.offset)
        .await
        .map_err(CortexError::from)?;
    Ok(Json(entries))
}

/// GET /api/admin/analytics/{report}?hours=
pub async fn analytics_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(report): Path<String>,
    Query(query): Query<ReportQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_tenant, principal) = admin_context(&state, &headers).await?;
    let allowed = principal.is_super_user || !principal.dept_head_for.is_empty();
    predicates::require(allowed, "analytics.read")?;

    let tenant_id = principal.tenant_id;
    let hours = query.hours.clamp(1, 24 * 90);
    let reports = &state.reports;
    let body = match report.as_str() {
        "overview" => serde_json::to_value(reports.overview(tenant_id, hours).await?),
        "queries-by-hour" => serde_json::to_value(reports.queries_by_hour(tenant_id, hours).await?),
        "categories" => serde_json::to_value(reports.category_breakdown(tenant_id, hours).await?),
        "intents" => serde_json::to_value(reports.intent_breakdown(tenant_id, hours).await?),
        "complexity" => {
            serde_json::to_value(reports.complexity_distribution(tenant_id, hours).await?)
        }
        "urgency" => serde_json::to_value(reports.urgency_breakdown(tenant_id, hours).await?),
        "departments" => serde_json::to_value(reports.department_usage(tenant_id, hours).await?),
        "temporal" => serde_json::to_value(reports.temporal_patterns(tenant_id, hours).await?),
        "errors" => serde_json::to_value(reports.recent_errors(tenant_id, hours, 50).await?),
        other => {
            return Err(CortexError::Internal(format!("unknown report: {}", other)).into());
        }
    }
    .map_err(CortexError::from)?;
    Ok(Json(body))
}

/// Load a target user, hiding cross-tenant rows behind 404.
fn load_target(
    state: &AppState,
    principal: &Principal,
    id: Uuid,
) -> Result<User, ApiError> {
    let target = state
        .users
        .by_id(id)
        .map_err(CortexError::from)?
        .filter(|u| u.tenant_id == principal.tenant_id)
        .ok_or_else(|| CortexError::NotFound(format!("user {}", id)))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn principal(heads: &[&str], is_super: bool) -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            email: "admin@acme.com".into(),
            departments: heads.iter().map(|s| s.to_string()).collect(),
            dept_head_for: heads.iter().map(|s| s.to_string()).collect(),
            is_super_user: is_super,
        }
    }

    fn target(depts: &[&str]) -> User {
        User {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            email: "t@acme.com".into(),
            display_name: "T".into(),
            external_subject_id: None,
            department_access: depts.iter().map(|s| s.to_string()).collect(),
            dept_head_for: Default::default(),
            is_super_user: false,
            is_active: true,
            password_hash: None,
            last_login_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sales_head_cannot_manage_credit_user() {
        let actor = principal(&["sales"], false);
        let credit_user = target(&["credit"]);
        assert!(!may_manage(&actor, &credit_user, &BTreeSet::new()));
    }

    #[test]
    fn sales_head_manages_sales_user() {
        let actor = principal(&["sales"], false);
        let sales_user = target(&["sales"]);
        assert!(may_manage(&actor, &sales_user, &BTreeSet::new()));
    }

    #[test]
    fn granting_a_foreign_department_is_refused() {
        let actor = principal(&["sales"], false);
        let sales_user = target(&["sales"]);
        let touched = BTreeSet::from(["credit".to_string()]);
        assert!(!may_manage(&actor, &sales_user, &touched));
    }

    #[test]
    fn super_user_manages_anyone() {
        let actor = principal(&[], true);
        let user = target(&["credit"]);
        assert!(may_manage(&actor, &user, &BTreeSet::new()));
    }

    #[test]
    fn nobody_manages_a_user_with_no_departments_except_super() {
        let actor = principal(&["sales"], false);
        let orphan = target(&[]);
        assert!(!may_manage(&actor, &orphan, &BTreeSet::new()));
    }
}

async fn write_audit(
    state: &AppState,
    actor: &Principal,
    target_id: Option<Uuid>,
    action: &str,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
) {
    let entry = AuditEntry {
        id: Uuid::now_v7(),
        tenant_id: actor.tenant_id,
        actor_id: actor.user_id,
        target_id,
        action: action.to_string(),
        department: None,
        before,
        after,
        reason: None,
        created_at: Utc::now(),
    };
    if let Err(e) = state.storage.record_audit(&entry).await {
        tracing::error!(error = %e, action, "audit write failed");
    }
}
