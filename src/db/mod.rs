//! Database connection management: opening, session pragmas, pooling,
//! schema, and migrations.

pub mod migrations;
pub mod pool;
pub mod schema;

use rusqlite::Connection;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Open one connection per the configured URL and apply the session pragmas.
///
/// File-backed databases get their parent directory created on demand.
/// In-memory URLs are opened with a shared cache so every pooled connection
/// sees the same database.
pub fn open_connection(config: &DatabaseConfig) -> Result<Connection> {
    if config.sync_url.is_some() || config.auth_token.is_some() {
        tracing::warn!("sync_url/auth_token are ignored by the embedded engine");
    }

    let conn = if config.is_memory() {
        Connection::open(shared_memory_uri(&config.url))?
    } else {
        let path = config.resolved_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Connection::open(path)?
    };

    configure_connection(&conn, config)?;
    Ok(conn)
}

/// Session pragmas applied to every connection on first open.
fn configure_connection(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    #[cfg(feature = "encryption")]
    if let Some(key) = &config.encryption_key {
        conn.pragma_update(None, "key", key)?;
    }
    #[cfg(not(feature = "encryption"))]
    if config.encryption_key.is_some() {
        tracing::warn!("encryption_key set but the `encryption` feature is not enabled");
    }

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -64000;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

/// Ensure an in-memory URL carries `cache=shared`.
fn shared_memory_uri(url: &str) -> String {
    if url.contains("cache=shared") {
        url.to_string()
    } else if url.contains('?') {
        format!("{url}&cache=shared")
    } else {
        "file::memory:?cache=shared".to_string()
    }
}

/// Result of a full database health check.
#[derive(Debug, serde::Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub schema_version: i64,
    pub rule_count: i64,
    pub project_doc_count: i64,
    pub ref_count: i64,
}

/// Probe the database and count stored rows.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let probe: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
    let schema_version = migrations::current_version(conn)?;

    let rule_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))
        .unwrap_or(0);
    let project_doc_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM project_docs", [], |row| row.get(0))
        .unwrap_or(0);
    let ref_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM refs", [], |row| row.get(0))
        .unwrap_or(0);

    let report = HealthReport {
        healthy: probe == 1 && schema_version >= schema::SCHEMA_VERSION,
        schema_version,
        rule_count,
        project_doc_count,
        ref_count,
    };
    info!(
        healthy = report.healthy,
        schema_version = report.schema_version,
        "database health checked"
    );
    Ok(report)
}
