use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::AppResult;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_INTERESTS: &[&str] = &[
    "Architecture",
    "Art",
    "Food",
    "History",
    "Museums",
    "Music",
    "Nature",
    "Nightlife",
    "Religion",
    "Science",
    "Shopping",
    "Sports",
];

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Creates the data directory, opens the store and brings the schema up to date.
pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let connection = open_connection(&db_path)?;
    connection.execute_batch("PRAGMA journal_mode = WAL;")?;
    run_migrations(&connection)?;
    seed_interests(&connection)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "database schema ready"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

/// Opens a connection to an already bootstrapped store.
pub fn open_connection(db_path: &Path) -> AppResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(connection)
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS sessions (
            token_hash TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS interests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS user_interests (
            user_id INTEGER NOT NULL,
            interest_id INTEGER NOT NULL,
            PRIMARY KEY (user_id, interest_id),
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
            FOREIGN KEY (interest_id) REFERENCES interests(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS visited_places (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            place_name TEXT,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            visited_at TEXT NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS cache (
            cache_key TEXT PRIMARY KEY,
            json_result TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
        CREATE INDEX IF NOT EXISTS idx_visited_user_time ON visited_places(user_id, visited_at);
        "#,
    )?;
    Ok(())
}

fn seed_interests(connection: &Connection) -> AppResult<()> {
    let mut stmt = connection.prepare("INSERT OR IGNORE INTO interests (name) VALUES (?1)")?;
    for name in DEFAULT_INTERESTS {
        stmt.execute([name])?;
    }
    Ok(())
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name IN ('users','sessions','interests','user_interests','visited_places','cache')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 6);
        assert!(ctx.path.ends_with("test.db"));
    }

    #[test]
    fn bootstrap_is_idempotent_and_seeds_once() {
        let dir = tempdir().unwrap();
        drop(bootstrap(dir.path(), "seed.db").unwrap());
        let ctx = bootstrap(dir.path(), "seed.db").unwrap();

        let count: i64 = ctx
            .connection
            .query_row("SELECT COUNT(*) FROM interests", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count as usize, DEFAULT_INTERESTS.len());
    }
}
