use rusqlite::{Connection, Result};

/// Initialise the users table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id                   TEXT PRIMARY KEY NOT NULL,
            tenant_id            TEXT NOT NULL,
            email                TEXT NOT NULL,
            display_name         TEXT NOT NULL,
            external_subject_id  TEXT,
            department_access    TEXT NOT NULL DEFAULT '[]',  -- JSON array
            dept_head_for        TEXT NOT NULL DEFAULT '[]',  -- JSON array
            is_super_user        INTEGER NOT NULL DEFAULT 0,
            is_active            INTEGER NOT NULL DEFAULT 1,
            password_hash        TEXT,
            last_login_at        TEXT,
            created_at           TEXT NOT NULL,
            updated_at           TEXT NOT NULL,
            UNIQUE(tenant_id, email)
        );
        CREATE INDEX IF NOT EXISTS idx_users_subject
            ON users(tenant_id, external_subject_id);",
    )
}

/// Map a SELECT row (column order from USER_SELECT_SQL) to a User.
/// Centralised here so every query in this crate stays consistent.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<crate::types::User> {
    use chrono::{DateTime, Utc};
    let parse_set = |s: String| -> std::collections::BTreeSet<String> {
        serde_json::from_str(&s).unwrap_or_default()
    };
    let parse_time = |s: String| -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    };
    let id: String = row.get(0)?;
    let tenant_id: String = row.get(1)?;
    Ok(crate::types::User {
        id: uuid::Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        tenant_id: uuid::Uuid::parse_str(&tenant_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        external_subject_id: row.get(4)?,
        department_access: parse_set(row.get(5)?),
        dept_head_for: parse_set(row.get(6)?),
        is_super_user: row.get::<_, i32>(7)? != 0,
        is_active: row.get::<_, i32>(8)? != 0,
        password_hash: row.get(9)?,
        last_login_at: row.get::<_, Option<String>>(10)?.and_then(parse_time),
        created_at: row
            .get::<_, String>(11)
            .map(|s| parse_time(s).unwrap_or_else(Utc::now))?,
        updated_at: row
            .get::<_, String>(12)
            .map(|s| parse_time(s).unwrap_or_else(Utc::now))?,
    })
}

pub(crate) const USER_SELECT_SQL: &str = "SELECT id, tenant_id, email, display_name,
    external_subject_id, department_access, dept_head_for, is_super_user,
    is_active, password_hash, last_login_at, created_at, updated_at FROM users";
