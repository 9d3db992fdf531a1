use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{row_to_user, USER_SELECT_SQL};
use crate::error::{IdentityError, Result};
use crate::types::{User, UserUpdate};

/// Cached user rows expire quickly; admin mutations also invalidate.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
const CACHE_MAX: usize = 512;

#[derive(Clone)]
struct CachedUser {
    user: User,
    fetched_at: Instant,
}

/// Owns the users table. Hot path is `by_subject` / `by_email` during
/// authentication; both go through a TTL cache keyed per tenant.
pub struct UserStore {
    db: Mutex<Connection>,
    cache: Mutex<HashMap<(Uuid, String), CachedUser>>,
    ttl: Duration,
}

impl UserStore {
    pub fn new(conn: Connection) -> Result<Self> {
        crate::db::init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
            ttl: DEFAULT_CACHE_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        let sql = format!("{} WHERE id = ?1", USER_SELECT_SQL);
        Ok(db
            .query_row(&sql, params![user_id.to_string()], row_to_user)
            .optional()?)
    }

    pub fn by_subject(&self, tenant_id: Uuid, subject: &str) -> Result<Option<User>> {
        let key = (tenant_id, format!("sub:{}", subject));
        if let Some(user) = self.cache_get(&key) {
            return Ok(Some(user));
        }
        let db = self.db.lock().unwrap();
        let sql = format!(
            "{} WHERE tenant_id = ?1 AND external_subject_id = ?2",
            USER_SELECT_SQL
        );
        let user = db
            .query_row(&sql, params![tenant_id.to_string(), subject], row_to_user)
            .optional()?;
        drop(db);
        if let Some(user) = &user {
            self.cache_put(key, user.clone());
        }
        Ok(user)
    }

    pub fn by_email(&self, tenant_id: Uuid, email: &str) -> Result<Option<User>> {
        let key = (tenant_id, format!("email:{}", email));
        if let Some(user) = self.cache_get(&key) {
            return Ok(Some(user));
        }
        let db = self.db.lock().unwrap();
        let sql = format!("{} WHERE tenant_id = ?1 AND email = ?2", USER_SELECT_SQL);
        let user = db
            .query_row(&sql, params![tenant_id.to_string(), email], row_to_user)
            .optional()?;
        drop(db);
        if let Some(user) = &user {
            self.cache_put(key, user.clone());
        }
        Ok(user)
    }

    /// Create a user on first successful authentication. Department access
    /// starts empty (fail-secure default); grants are an admin action.
    pub fn provision(
        &self,
        tenant_id: Uuid,
        email: &str,
        display_name: &str,
        subject: Option<&str>,
    ) -> Result<User> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            email: email.to_string(),
            display_name: display_name.to_string(),
            external_subject_id: subject.map(String::from),
            department_access: Default::default(),
            dept_head_for: Default::default(),
            is_super_user: false,
            is_active: true,
            password_hash: None,
            last_login_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO users (id, tenant_id, email, display_name, external_subject_id,
                department_access, dept_head_for, is_super_user, is_active,
                password_hash, last_login_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]', '[]', 0, 1, NULL, ?6, ?6, ?6)",
            params![
                user.id.to_string(),
                tenant_id.to_string(),
                email,
                display_name,
                user.external_subject_id,
                now.to_rfc3339(),
            ],
        )?;
        info!(user_id = %user.id, %tenant_id, "user provisioned");
        Ok(user)
    }

    /// Bind an external subject id to an existing row found by email.
    pub fn attach_subject(&self, user_id: Uuid, subject: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE users SET external_subject_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id.to_string(), subject, Utc::now().to_rfc3339()],
        )?;
        drop(db);
        self.invalidate(user_id);
        Ok(())
    }

    pub fn touch_login(&self, user_id: Uuid) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE users SET last_login_at = ?2 WHERE id = ?1",
            params![user_id.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Apply an admin patch. `dept_head_for` is clamped to a subset of
    /// `department_access` so the invariant holds regardless of input.
    pub fn update(&self, user_id: Uuid, patch: &UserUpdate) -> Result<User> {
        let mut user = self
            .by_id(user_id)?
            .ok_or_else(|| IdentityError::NotFound(user_id.to_string()))?;

        if let Some(name) = &patch.display_name {
            user.display_name = name.clone();
        }
        if let Some(access) = &patch.department_access {
            user.department_access = access.clone();
        }
        if let Some(heads) = &patch.dept_head_for {
            user.dept_head_for = heads.clone();
        }
        user.dept_head_for = user
            .dept_head_for
            .intersection(&user.department_access)
            .cloned()
            .collect();
        if let Some(is_super) = patch.is_super_user {
            user.is_super_user = is_super;
        }
        user.updated_at = Utc::now();

        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE users SET display_name = ?2, department_access = ?3,
                dept_head_for = ?4, is_super_user = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                user_id.to_string(),
                user.display_name,
                serde_json::to_string(&user.department_access)?,
                serde_json::to_string(&user.dept_head_for)?,
                user.is_super_user as i32,
                user.updated_at.to_rfc3339(),
            ],
        )?;
        drop(db);
        self.invalidate(user_id);
        Ok(user)
    }

    /// Soft delete. Rows are never removed.
    pub fn set_active(&self, user_id: Uuid, active: bool) -> Result<User> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE users SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                user_id.to_string(),
                active as i32,
                Utc::now().to_rfc3339()
            ],
        )?;
        drop(db);
        if changed == 0 {
            return Err(IdentityError::NotFound(user_id.to_string()));
        }
        self.invalidate(user_id);
        self.by_id(user_id)?
            .ok_or_else(|| IdentityError::NotFound(user_id.to_string()))
    }

    /// Admin listing with optional department and substring filters.
    pub fn list(
        &self,
        tenant_id: Uuid,
        department: Option<&str>,
        search: Option<&str>,
    ) -> Result<Vec<User>> {
        let db = self.db.lock().unwrap();
        let sql = format!("{} WHERE tenant_id = ?1 ORDER BY email", USER_SELECT_SQL);
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params![tenant_id.to_string()], row_to_user)?;
        let mut users: Vec<User> = rows.filter_map(|r| r.ok()).collect();

        // Department membership lives in a JSON column, so filter here
        // rather than in SQL.
        if let Some(dept) = department {
            users.retain(|u| u.department_access.contains(dept));
        }
        if let Some(needle) = search {
            let needle = needle.to_ascii_lowercase();
            users.retain(|u| {
                u.email.to_ascii_lowercase().contains(&needle)
                    || u.display_name.to_ascii_lowercase().contains(&needle)
            });
        }
        Ok(users)
    }

    /// Drop every cache entry for this user. Called after admin mutations.
    pub fn invalidate(&self, user_id: Uuid) {
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|_, v| v.user.id != user_id);
    }

    fn cache_get(&self, key: &(Uuid, String)) -> Option<User> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(key)?;
        if entry.fetched_at.elapsed() < self.ttl {
            debug!(key = %key.1, "user cache hit");
            Some(entry.user.clone())
        } else {
            None
        }
    }

    fn cache_put(&self, key: (Uuid, String), user: User) {
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= CACHE_MAX {
            // Evict the stalest entry to stay bounded.
            let oldest = cache
                .iter()
                .min_by_key(|(_, v)| v.fetched_at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                cache.remove(&k);
            }
        }
        cache.insert(key, CachedUser {
            user,
            fetched_at: Instant::now(),
        });
    }
}
