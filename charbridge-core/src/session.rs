// ABOUTME: Surface-to-session registry backed by a persistent per-bot store.
// ABOUTME: Sessions are created lazily through the RemoteClient and reused until overridden.
use crate::error::SessionError;
use crate::traits::Surface;
use anyhow::{Context, Result};
use charbridge_backend::{RemoteClient, Turn};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A surface bound to its remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub surface: Surface,
    pub session_id: String,
}

/// One persisted row of the surface map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub surface_key: String,
    pub session_id: String,
    pub updated_at: String,
}

// =============================================================================
// Persistent Store
// =============================================================================

/// Durable surface key -> session id map for one bot
pub trait SessionStore: Send + Sync {
    fn get(&self, surface_key: &str) -> Result<Option<String>>;

    fn set(&self, surface_key: &str, session_id: &str) -> Result<()>;

    /// Make every prior `set` durable
    fn flush(&self) -> Result<()>;

    fn list(&self) -> Result<Vec<SessionBinding>>;
}

/// SQLite store; every write is committed before `set` returns
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create session directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path).context("Failed to open SQLite database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS surfaces (
                surface_key TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Store at `<workspace>/<bot>/sessions.db`
    pub fn open_for_bot<P: AsRef<Path>>(workspace_path: P, bot_name: &str) -> Result<Self> {
        Self::new(workspace_path.as_ref().join(bot_name).join("sessions.db"))
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| anyhow::anyhow!("Database mutex poisoned: {}", e))
    }
}

impl SessionStore for SqliteSessionStore {
    fn get(&self, surface_key: &str) -> Result<Option<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT session_id FROM surfaces WHERE surface_key = ?1")?;
        let session_id = stmt.query_row(params![surface_key], |row| row.get::<_, String>(0));

        match session_id {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, surface_key: &str, session_id: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO surfaces (surface_key, session_id, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(surface_key) DO UPDATE SET session_id = ?2, updated_at = ?3",
            params![surface_key, session_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Autocommit mode: nothing is buffered
        Ok(())
    }

    fn list(&self) -> Result<Vec<SessionBinding>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT surface_key, session_id, updated_at FROM surfaces ORDER BY updated_at DESC",
        )?;
        let bindings = stmt
            .query_map([], |row| {
                Ok(SessionBinding {
                    surface_key: row.get(0)?,
                    session_id: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(bindings)
    }
}

/// In-memory store for tests and dry runs
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, SessionBinding>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionBinding>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Session store mutex poisoned: {}", e))
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, surface_key: &str) -> Result<Option<String>> {
        Ok(self
            .entries()?
            .get(surface_key)
            .map(|b| b.session_id.clone()))
    }

    fn set(&self, surface_key: &str, session_id: &str) -> Result<()> {
        self.entries()?.insert(
            surface_key.to_string(),
            SessionBinding {
                surface_key: surface_key.to_string(),
                session_id: session_id.to_string(),
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn list(&self) -> Result<Vec<SessionBinding>> {
        let mut bindings: Vec<_> = self.entries()?.values().cloned().collect();
        bindings.sort_by(|a, b| a.surface_key.cmp(&b.surface_key));
        Ok(bindings)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Maps surfaces onto remote sessions for one bot.
///
/// Lookups and creation run under one async lock so two first messages
/// from the same surface can't create two sessions.
pub struct SessionRegistry {
    client: RemoteClient,
    store: Arc<dyn SessionStore>,
    cache: tokio::sync::Mutex<HashMap<String, String>>,
    with_greeting: bool,
}

impl SessionRegistry {
    pub fn new(client: RemoteClient, store: Arc<dyn SessionStore>, with_greeting: bool) -> Self {
        Self {
            client,
            store,
            cache: tokio::sync::Mutex::new(HashMap::new()),
            with_greeting,
        }
    }

    /// Bound session without creating one
    pub async fn lookup(&self, surface: &Surface) -> Result<Option<Session>, SessionError> {
        let mut cache = self.cache.lock().await;
        self.lookup_locked(&mut cache, surface)
    }

    fn lookup_locked(
        &self,
        cache: &mut HashMap<String, String>,
        surface: &Surface,
    ) -> Result<Option<Session>, SessionError> {
        let key = surface.key();
        if let Some(id) = cache.get(&key) {
            return Ok(Some(Session {
                surface: surface.clone(),
                session_id: id.clone(),
            }));
        }

        let stored = self
            .store
            .get(&key)
            .with_context(|| format!("Failed to read session for {}", key))?;
        Ok(stored.map(|id| {
            cache.insert(key, id.clone());
            Session {
                surface: surface.clone(),
                session_id: id,
            }
        }))
    }

    /// Bound session, creating (and persisting) one on first use
    pub async fn resolve(&self, surface: &Surface) -> Result<Session, SessionError> {
        let mut cache = self.cache.lock().await;
        if let Some(session) = self.lookup_locked(&mut cache, surface)? {
            return Ok(session);
        }

        let created = self.client.create_session(self.with_greeting).await?;
        crate::metrics::record_session_created();
        tracing::info!(
            surface = %surface,
            session_id = %created.session_id,
            "Created session for surface"
        );

        let key = surface.key();
        if let Err(e) = self.persist(&key, &created.session_id) {
            // The binding still holds for this process; it is lost on restart
            tracing::warn!(surface = %key, error = %e, "Failed to persist new session");
        }
        cache.insert(key, created.session_id.clone());

        Ok(Session {
            surface: surface.clone(),
            session_id: created.session_id,
        })
    }

    /// Rebind a surface to an existing session
    pub async fn override_session(
        &self,
        surface: &Surface,
        session_id: impl Into<String>,
    ) -> Result<Session, SessionError> {
        let session_id = session_id.into();
        let mut cache = self.cache.lock().await;
        let key = surface.key();
        self.persist(&key, &session_id)?;
        cache.insert(key, session_id.clone());
        tracing::info!(surface = %surface, session_id = %session_id, "Session overridden");

        Ok(Session {
            surface: surface.clone(),
            session_id,
        })
    }

    /// Start a fresh session for a surface and bind it. Returns the greeting
    /// turn when one was requested and produced.
    pub async fn new_session(
        &self,
        surface: &Surface,
        with_greeting: bool,
    ) -> Result<(Session, Option<Turn>), SessionError> {
        let mut cache = self.cache.lock().await;
        let created = self.client.create_session(with_greeting).await?;
        crate::metrics::record_session_created();

        let key = surface.key();
        self.persist(&key, &created.session_id)?;
        cache.insert(key, created.session_id.clone());
        tracing::info!(
            surface = %surface,
            session_id = %created.session_id,
            "Started new chat"
        );

        let session = Session {
            surface: surface.clone(),
            session_id: created.session_id,
        };
        Ok((session, created.greeting))
    }

    pub fn list(&self) -> Result<Vec<SessionBinding>> {
        self.store.list()
    }

    fn persist(&self, key: &str, session_id: &str) -> Result<()> {
        self.store
            .set(key, session_id)
            .with_context(|| format!("Failed to store session for {}", key))?;
        self.store.flush().context("Failed to flush session store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SqliteSessionStore::open_for_bot(dir.path(), "alfred").unwrap();

        assert_eq!(store.get("server-1").unwrap(), None);
        store.set("server-1", "s1").unwrap();
        store.set("server-1", "s2").unwrap();
        store.set("private-9", "s3").unwrap();
        store.flush().unwrap();

        assert_eq!(store.get("server-1").unwrap(), Some("s2".to_string()));
        assert_eq!(store.list().unwrap().len(), 2);
        assert!(dir.path().join("alfred").join("sessions.db").exists());
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SqliteSessionStore::new(&path).unwrap();
            store.set("server-1", "s1").unwrap();
        }
        let reopened = SqliteSessionStore::new(&path).unwrap();
        assert_eq!(reopened.get("server-1").unwrap(), Some("s1".to_string()));
    }

    #[test]
    fn test_memory_store_lists_sorted() {
        let store = MemorySessionStore::new();
        store.set("server-2", "b").unwrap();
        store.set("private-1", "a").unwrap();
        let keys: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|b| b.surface_key)
            .collect();
        assert_eq!(keys, vec!["private-1", "server-2"]);
    }
}
