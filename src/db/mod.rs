mod schema;
pub mod faces;
pub mod groups;
pub mod photos;
pub mod settings;

use rusqlite::{Connection, Transaction};
use std::path::Path;

use crate::error::Result;

pub use faces::{BoundingBox, FaceObservation, NewObservation};
pub use groups::{GroupSummary, LibraryStats, StoredRepresentative};
pub use photos::Photo;
pub use schema::SCHEMA;

/// SQLite-backed index of photos, face observations and groups.
///
/// `Database` is not `Sync`; callers share it behind a lock (see
/// [`crate::faces::FaceIndex`]).
pub struct Database {
    pub(crate) conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Start a transaction on the shared connection. Other methods on
    /// `self` run inside it until it is committed or dropped.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Remove every photo, observation and group. Settings are kept.
    pub fn clear_all(&self) -> Result<()> {
        let tx = self.transaction()?;
        tx.execute_batch(
            r#"
            DELETE FROM group_members;
            DELETE FROM face_groups;
            DELETE FROM faces;
            DELETE FROM photos;
            "#,
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("nested/index.db")).unwrap();

        let tables: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('photos', 'faces', 'face_groups', 'group_members', 'settings')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);

        // Reopening an existing database is fine.
        drop(db);
        Database::open(&dir.path().join("nested/index.db")).unwrap();
    }
}
