//! Authorization predicates — pure functions over a [`Principal`].
//!
//! These are evaluated by the gateway and again by the storage layer at
//! query-construction time (defense in depth). They never consult the IdP.

use cortex_core::types::Principal;
use cortex_core::CortexError;
use uuid::Uuid;

/// Read access: super users see everything, others only their grants.
pub fn can_read_department(p: &Principal, dept: &str) -> bool {
    p.is_super_user || p.departments.contains(dept)
}

/// Write access requires a dept-head grant for that department.
pub fn can_write_department(p: &Principal, dept: &str) -> bool {
    p.is_super_user || p.dept_head_for.contains(dept)
}

/// Whether `actor` may manage (update, grant, deactivate) `target` within
/// `dept`. Dept heads cannot manage themselves through their own
/// department; super users can manage anyone but themselves for
/// destructive actions (see [`can_deactivate`]).
pub fn can_manage_user(actor: &Principal, target_id: Uuid, dept: &str) -> bool {
    if actor.is_super_user {
        return true;
    }
    actor.dept_head_for.contains(dept) && target_id != actor.user_id
}

/// A principal may never deactivate itself, super user or not.
pub fn can_deactivate(actor: &Principal, target_id: Uuid) -> bool {
    if target_id == actor.user_id {
        return false;
    }
    actor.is_super_user
}

/// Convenience wrapper turning a predicate miss into the taxonomy error,
/// carrying the action name for the 403 body.
pub fn require(allowed: bool, action: &str) -> Result<(), CortexError> {
    if allowed {
        Ok(())
    } else {
        Err(CortexError::Forbidden {
            action: action.to_string(),
        })
    }
}
