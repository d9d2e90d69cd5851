//! Forward-only schema migration runner.
//!
//! Tracks applied versions in `schema_migrations` and advances the database
//! through the declared sequence. Every step runs in its own transaction: a
//! version becomes durable only when its transaction commits, and a failure
//! mid-sequence leaves the committed prefix authoritative.

use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::db::schema::{Migration, SCHEMA_SQL, SCHEMA_VERSION};
use crate::error::{Error, Result};

/// Maximum applied version, or 0 when `schema_migrations` does not exist
/// yet (the very first run against a fresh file).
pub fn current_version(conn: &Connection) -> Result<i64> {
    match conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    ) {
        Ok(version) => Ok(version),
        Err(e) if e.to_string().contains("no such table") => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// One record per applied migration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub applied_at: String,
    pub description: Option<String>,
}

/// All applied migrations, ascending by version.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<MigrationRecord>> {
    let mut stmt = conn.prepare(
        "SELECT version, applied_at, description FROM schema_migrations ORDER BY version",
    )?;
    let records = stmt
        .query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get(0)?,
                applied_at: row.get(1)?,
                description: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Create the full v1 schema if the database is at version 0.
///
/// The DDL and the version record commit in one transaction; on any failure
/// the database stays at version 0. Calling this against an up-to-date
/// database is a no-op.
pub fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let version = current_version(conn)?;
    if version >= SCHEMA_VERSION {
        debug!(version, "schema already initialized");
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_SQL)
        .map_err(|e| Error::MigrationFailed {
            version: SCHEMA_VERSION,
            source: e,
        })?;
    tx.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?1, ?2, ?3)",
        params![
            SCHEMA_VERSION,
            chrono::Utc::now().to_rfc3339(),
            "Initial schema"
        ],
    )?;
    tx.commit()?;

    info!(version = SCHEMA_VERSION, "schema initialized");
    Ok(())
}

/// Apply one migration: its `up` statements and the version record commit
/// together, or not at all.
pub fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn.transaction()?;
    for statement in migration.up {
        tx.execute_batch(statement)
            .map_err(|e| Error::MigrationFailed {
                version: migration.version,
                source: e,
            })?;
    }
    tx.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?1, ?2, ?3)",
        params![
            migration.version,
            chrono::Utc::now().to_rfc3339(),
            migration.description
        ],
    )?;
    tx.commit()?;

    info!(version = migration.version, description = migration.description, "migration applied");
    Ok(())
}

/// Reverse one migration: its `down` statements run and the version record
/// is deleted in a single transaction.
pub fn rollback_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn.transaction()?;
    for statement in migration.down {
        tx.execute_batch(statement)
            .map_err(|e| Error::MigrationFailed {
                version: migration.version,
                source: e,
            })?;
    }
    tx.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        params![migration.version],
    )?;
    tx.commit()?;

    info!(version = migration.version, "migration rolled back");
    Ok(())
}

/// Apply every declared migration with a version above the current one, in
/// ascending order. Stops at the first failure; migrations already applied
/// in this run stay committed.
pub fn run_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<()> {
    let version = current_version(conn)?;
    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| m.version > version)
        .collect();
    pending.sort_by_key(|m| m.version);

    debug!(
        current = version,
        pending = pending.len(),
        "checking migrations"
    );

    for migration in pending {
        apply_migration(conn, migration)?;
    }
    Ok(())
}
