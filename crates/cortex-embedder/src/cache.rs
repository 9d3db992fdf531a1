//! Persistent content-addressed embedding cache.
//!
//! Keyed by SHA-256 of the exact input text, so identical texts hit the
//! cache regardless of which query produced them. Safe for concurrent
//! readers and writers; hits never touch the network.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::debug;

pub struct EmbedCache {
    db: Mutex<Connection>,
    dim: usize,
}

impl EmbedCache {
    pub fn open(path: &Path, dim: usize) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, dim)
    }

    pub fn in_memory(dim: usize) -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, dim)
    }

    fn from_connection(conn: Connection, dim: usize) -> rusqlite::Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS embed_cache (
                hash       TEXT PRIMARY KEY NOT NULL,
                dim        INTEGER NOT NULL,
                vector     BLOB NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            db: Mutex::new(conn),
            dim,
        })
    }

    pub fn content_hash(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let hash = Self::content_hash(text);
        let db = self.db.lock().unwrap();
        let row: Option<(i64, Vec<u8>)> = db
            .query_row(
                "SELECT dim, vector FROM embed_cache WHERE hash = ?1",
                params![hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .ok()
            .flatten();
        let (dim, blob) = row?;
        if dim as usize != self.dim {
            // Stale entry from an older dimension config; ignore it.
            return None;
        }
        debug!(hash = %&hash[..8], "embed cache hit");
        Some(decode(&blob))
    }

    pub fn put(&self, text: &str, vector: &[f32]) {
        let hash = Self::content_hash(text);
        let db = self.db.lock().unwrap();
        let _ = db.execute(
            "INSERT OR REPLACE INTO embed_cache (hash, dim, vector, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                hash,
                vector.len() as i64,
                encode(vector),
                chrono_now(),
            ],
        );
    }
}

fn chrono_now() -> String {
    // Epoch seconds; enough for cache-age inspection with sqlite3.
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.to_string()
}

fn encode(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
