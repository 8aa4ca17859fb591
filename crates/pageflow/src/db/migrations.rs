//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order. The job store and the broker keep separate
//! migration sets because they live in separate database files.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
pub struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Job store schema: jobs, page results, final results.
pub const STORE: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
    },
    Migration {
        version: 2,
        description: "create_page_results_table",
        sql: include_str!("sql/002_create_page_results.sql"),
    },
    Migration {
        version: 3,
        description: "create_final_results_table",
        sql: include_str!("sql/003_create_final_results.sql"),
    },
];

/// Broker schema: topics, the message log and per-group delivery state.
pub const BROKER: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_broker_topics_table",
        sql: include_str!("sql/101_create_broker_topics.sql"),
    },
    Migration {
        version: 2,
        description: "create_broker_messages_table",
        sql: include_str!("sql/102_create_broker_messages.sql"),
    },
    Migration {
        version: 3,
        description: "create_broker_deliveries_table",
        sql: include_str!("sql/103_create_broker_deliveries.sql"),
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection, migrations: &[Migration]) -> Result<(), DatabaseError> {
    // Create the migrations tracking table.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in migrations {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        conn.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}
