use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use cortex_core::types::Principal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user row. Belongs to exactly one tenant; soft-deleted via
/// `is_active = false`, never removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub external_subject_id: Option<String>,
    pub department_access: BTreeSet<String>,
    /// Always a subset of `department_access`.
    pub dept_head_for: BTreeSet<String>,
    pub is_super_user: bool,
    pub is_active: bool,
    /// Argon2 hash, only for consumer password accounts.
    pub password_hash: Option<String>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.id,
            tenant_id: self.tenant_id,
            email: self.email.clone(),
            departments: self.department_access.clone(),
            dept_head_for: self.dept_head_for.clone(),
            is_super_user: self.is_super_user,
        }
    }
}

/// Patch applied by admin update endpoints. Absent fields stay untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub display_name: Option<String>,
    pub department_access: Option<BTreeSet<String>>,
    pub dept_head_for: Option<BTreeSet<String>>,
    pub is_super_user: Option<bool>,
}
