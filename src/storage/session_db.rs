use chrono::Utc;
use rusqlite::{OptionalExtension, Result as SqlResult, params};
use std::path::Path;

use super::database::Database;
use super::models::StoredSession;

/// Database holding the login session across restarts
pub struct SessionDatabase {
    db: Database,
}

impl SessionDatabase {
    /// Initialize session database at custom path
    pub fn with_path<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let db = Database::new(path)?;
        Self::init(db)
    }

    pub fn in_memory() -> SqlResult<Self> {
        Self::init(Database::in_memory()?)
    }

    fn init(db: Database) -> SqlResult<Self> {
        let session_db = Self { db };
        session_db.init_schema()?;
        Ok(session_db)
    }

    fn init_schema(&self) -> SqlResult<()> {
        let conn = self.db.connection();

        // Session table (single row)
        conn.execute(
            "CREATE TABLE IF NOT EXISTS session (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                user_id INTEGER,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        Ok(())
    }

    /// Save session (replace if exists)
    pub fn save_session(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user_id: Option<i64>,
    ) -> SqlResult<()> {
        let conn = self.db.connection();
        conn.execute(
            "INSERT OR REPLACE INTO session (id, access_token, refresh_token, user_id, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![access_token, refresh_token, user_id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Get session
    pub fn load_session(&self) -> SqlResult<Option<StoredSession>> {
        let conn = self.db.connection();
        let mut stmt = conn.prepare(
            "SELECT access_token, refresh_token, user_id, updated_at FROM session WHERE id = 1",
        )?;

        let session = stmt
            .query_row([], |row| {
                Ok(StoredSession {
                    access_token: row.get(0)?,
                    refresh_token: row.get(1)?,
                    user_id: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })
            .optional()?;

        Ok(session)
    }

    /// Forget the session (logout or expiry)
    pub fn clear_session(&self) -> SqlResult<()> {
        let conn = self.db.connection();
        conn.execute("DELETE FROM session", [])?;
        Ok(())
    }
}
