pub mod models;
pub mod queries;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL so a background audit worker and readers can share the file
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: catalog, users, audits and their matches
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id          TEXT PRIMARY KEY,
                email       TEXT,
                name        TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tracks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                isrc        TEXT UNIQUE,
                title       TEXT NOT NULL,
                artist      TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_title_artist ON tracks(title, artist);

            CREATE TABLE IF NOT EXISTS audits (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         TEXT NOT NULL REFERENCES users(id),
                file_name       TEXT NOT NULL,
                status          TEXT NOT NULL,
                tracks_scanned  INTEGER NOT NULL DEFAULT 0,
                matches_found   INTEGER NOT NULL DEFAULT 0,
                missing_amount  REAL NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL,
                completed_at    TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_audits_user ON audits(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_audits_status ON audits(status);

            CREATE TABLE IF NOT EXISTS track_matches (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                audit_id      INTEGER NOT NULL REFERENCES audits(id) ON DELETE CASCADE,
                track_id      INTEGER REFERENCES tracks(id),
                isrc          TEXT,
                title         TEXT NOT NULL,
                artist        TEXT NOT NULL,
                pro           TEXT NOT NULL,
                match_type    TEXT NOT NULL,
                amount_found  REAL NOT NULL,
                timestamp     TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_matches_audit ON track_matches(audit_id);
            CREATE INDEX IF NOT EXISTS idx_matches_track ON track_matches(track_id);
            ",
        )?;
        Ok(())
    }

    /// V2: statement traceability on matches (score, period, plays, raw row, source position)
    fn migrate_v2(&self) -> Result<()> {
        let new_columns = [
            "score REAL",
            "period TEXT NOT NULL DEFAULT ''",
            "plays INTEGER",
            "raw_data TEXT", // JSON object of the original statement row
            "record_index INTEGER NOT NULL DEFAULT 0",
        ];

        for col in &new_columns {
            try_add_column(&self.conn, "track_matches", col)?;
        }

        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 2;

/// Try to add a column, ignore if it already exists.
fn try_add_column(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column_def}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("duplicate column") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Timestamps are stored as RFC 3339 UTC strings so they sort lexically.
pub(crate) fn to_db_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_rerunnable() {
        let db = Database::open_in_memory().unwrap();
        db.conn.pragma_update(None, "user_version", 1).unwrap();
        db.migrate().unwrap();

        let version: i32 = db.conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        assert!(matches!(db.migrate(), Err(DbError::Migration(_))));
    }

    #[test]
    fn test_db_time_sorts_lexically() {
        let earlier = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z").unwrap().with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2024-11-02T03:04:05Z").unwrap().with_timezone(&Utc);
        assert!(to_db_time(&earlier) < to_db_time(&later));
        assert_eq!(to_db_time(&earlier), "2024-01-02T03:04:05.000Z");
    }
}
