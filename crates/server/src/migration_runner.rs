//! Lightweight migration runner for rusqlite.
//!
//! Migrations are compiled into the binary, tracked by version in
//! `schema_versions`, and applied in order at startup.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::info;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "001_initial",
        sql: include_str!("../migrations/001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "002_session_archive",
        sql: include_str!("../migrations/002_session_archive.sql"),
    },
];

/// Pragmas every connection in the daemon uses.
pub const CONNECTION_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA busy_timeout = 5000;
     PRAGMA synchronous = NORMAL;";

/// Run all pending migrations against the given connection.
///
/// Returns how many migrations were applied. A failing migration aborts
/// startup; its transaction is rolled back so the version is not recorded.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<usize> {
    conn.execute_batch(CONNECTION_PRAGMAS)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let mut pending = 0;
    for migration in MIGRATIONS {
        if applied.contains(&migration.version) {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql).map_err(|e| {
            anyhow::anyhow!("migration {} failed: {e}", migration.name)
        })?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = migration.version,
            name = %migration.name,
            "Applied migration"
        );
        pending += 1;
    }

    info!(
        component = "migrations",
        event = "migrations.complete",
        total = MIGRATIONS.len(),
        applied = pending,
        skipped = MIGRATIONS.len() - pending,
        "Migration check complete"
    );

    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("daemon.db")).unwrap();

        assert_eq!(run_migrations(&mut conn).unwrap(), MIGRATIONS.len());
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as i64);
    }

    #[test]
    fn versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }

    #[test]
    fn schema_has_expected_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("daemon.db")).unwrap();
        run_migrations(&mut conn).unwrap();

        for table in [
            "background_processes",
            "config",
            "env_profiles",
            "secrets",
            "mcp_servers",
            "session_turns",
        ] {
            let exists: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "missing table {table}");
        }
    }
}
