// Credential storage backends

use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use crate::error::StoreError;

/// Store key holding the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Store key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Durable key-value storage for session credentials.
///
/// Shared by every in-flight request, so implementations must tolerate
/// concurrent callers.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local store, used for ephemeral sessions and tests
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a token pair
    pub fn with_tokens(access_token: &str, refresh_token: &str) -> Self {
        let mut entries = HashMap::new();
        entries.insert(ACCESS_TOKEN_KEY.to_string(), access_token.to_string());
        entries.insert(REFRESH_TOKEN_KEY.to_string(), refresh_token.to_string());
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// SQLite-backed store using an `auth_kv` table.
///
/// Keys are namespaced by `scope` so several accounts or environments can
/// share one database file.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    scope: String,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at `path`
    pub fn open(path: &Path, scope: &str) -> Result<Self, StoreError> {
        tracing::debug!(path = %path.display(), scope = scope, "Opening credential database");
        let conn = Connection::open(path)?;
        Self::init(conn, scope)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory(scope: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, scope)
    }

    fn init(conn: Connection, scope: &str) -> Result<Self, StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            scope: scope.to_string(),
        })
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}:{}", self.scope, key)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let value = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [self.scoped(key)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [self.scoped(key).as_str(), value],
        )?;
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [self.scoped(key)])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);

        store.set(ACCESS_TOKEN_KEY, "T1").unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T1"));

        store.clear(ACCESS_TOKEN_KEY).unwrap();
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);

        // Clearing a missing key is fine
        store.clear(REFRESH_TOKEN_KEY).unwrap();
    }

    #[test]
    fn test_memory_store_with_tokens() {
        let store = MemoryCredentialStore::with_tokens("T1", "R1");
        assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("T1"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R1"));
    }

    #[test]
    fn test_sqlite_store_upsert_and_clear() {
        let store = SqliteCredentialStore::open_in_memory("default").unwrap();
        store.set(REFRESH_TOKEN_KEY, "R1").unwrap();
        store.set(REFRESH_TOKEN_KEY, "R2").unwrap();
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R2"));

        store.clear(REFRESH_TOKEN_KEY).unwrap();
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_scopes_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        let work = SqliteCredentialStore::open(&path, "work").unwrap();
        let personal = SqliteCredentialStore::open(&path, "personal").unwrap();

        work.set(ACCESS_TOKEN_KEY, "work-token").unwrap();
        personal.set(ACCESS_TOKEN_KEY, "personal-token").unwrap();

        assert_eq!(work.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("work-token"));
        assert_eq!(
            personal.get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
            Some("personal-token")
        );
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        {
            let store = SqliteCredentialStore::open(&path, "default").unwrap();
            store.set(REFRESH_TOKEN_KEY, "R1").unwrap();
        }

        let store = SqliteCredentialStore::open(&path, "default").unwrap();
        assert_eq!(store.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R1"));
    }
}
