use rusqlite::{Connection, Result as SqlResult};
use std::path::Path;

/// Base database connection wrapper
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|_| rusqlite::Error::InvalidPath(path.as_ref().to_path_buf()))?;
            }
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data/session.db");
        let db = Database::new(&path).unwrap();
        db.connection()
            .execute_batch("CREATE TABLE probe (id INTEGER)")
            .unwrap();
        assert!(path.exists());
    }
}
