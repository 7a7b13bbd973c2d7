//! Embedded, numbered SQL migrations.
//!
//! Files are compiled into the binary with `include_str!` rather than
//! scanned from disk at startup, since the binary ships self-contained.
//! Each entry is applied exactly once, in order, inside its own
//! transaction that also records its version in `schema_migrations`.

use crate::error::ConfigError;
use rusqlite::Connection;

pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "conversations_and_messages",
        sql: include_str!("../../migrations/001_conversations_and_messages.sql"),
    },
    Migration {
        version: 2,
        name: "llm_requests",
        sql: include_str!("../../migrations/002_llm_requests.sql"),
    },
    Migration {
        version: 3,
        name: "models",
        sql: include_str!("../../migrations/003_models.sql"),
    },
];

/// Duplicate migration version numbers are a configuration error we can
/// (and do) catch before ever touching the database.
pub fn check_no_duplicate_versions() -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for m in MIGRATIONS {
        if !seen.insert(m.version) {
            return Err(ConfigError::DuplicateMigrationVersion(m.version));
        }
    }
    Ok(())
}

pub fn run(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )?;

    let applied: std::collections::HashSet<i64> = conn
        .prepare("SELECT version FROM schema_migrations")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    for m in MIGRATIONS {
        if applied.contains(&m.version) {
            continue;
        }
        tracing::info!(version = m.version, name = m.name, "applying migration");
        conn.execute_batch("BEGIN")?;
        let result: rusqlite::Result<()> = (|| {
            conn.execute_batch(m.sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![m.version, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })();
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                conn.execute_batch("ROLLBACK")?;
                return Err(e);
            }
        }
    }
    Ok(())
}
