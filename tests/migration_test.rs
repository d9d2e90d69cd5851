//! Migration runner behavior across real database files, including
//! close-and-reopen idempotence.

use engram::config::DatabaseConfig;
use engram::db;
use engram::db::migrations::{
    applied_migrations, apply_migration, current_version, initialize_schema, rollback_migration,
    run_migrations,
};
use engram::db::schema::{Migration, SCHEMA_VERSION};
use tempfile::TempDir;

fn file_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        url: format!("file:{}", dir.path().join("migrate.db").display()),
        ..DatabaseConfig::default()
    }
}

#[test]
fn initialize_is_idempotent_across_reopen() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir);

    {
        let mut conn = db::open_connection(&config).unwrap();
        initialize_schema(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    // reopen the same file and initialize again
    let mut conn = db::open_connection(&config).unwrap();
    initialize_schema(&mut conn).unwrap();
    assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);

    let records = applied_migrations(&conn).unwrap();
    assert_eq!(records.len(), 1, "no duplicate schema_migrations rows");
    assert_eq!(records[0].version, 1);
    assert_eq!(records[0].description.as_deref(), Some("Initial schema"));

    // all four tables present
    let tables: Vec<String> = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type='table' \
             AND name IN ('schema_migrations','rules','project_docs','refs') ORDER BY name",
        )
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(tables.len(), 4);
}

#[test]
fn versions_form_a_contiguous_prefix() {
    let dir = TempDir::new().unwrap();
    let mut conn = db::open_connection(&file_config(&dir)).unwrap();
    initialize_schema(&mut conn).unwrap();

    const V2: Migration = Migration {
        version: 2,
        description: "Unique ref names",
        up: &["CREATE UNIQUE INDEX idx_refs_name_unique ON refs(name)"],
        down: &["DROP INDEX idx_refs_name_unique"],
    };
    const V3: Migration = Migration {
        version: 3,
        description: "Rule tag join table",
        up: &["CREATE TABLE rule_tags (rule_id TEXT NOT NULL, tag TEXT NOT NULL)"],
        down: &["DROP TABLE rule_tags"],
    };

    run_migrations(&mut conn, &[V2, V3]).unwrap();
    let versions: Vec<i64> = applied_migrations(&conn)
        .unwrap()
        .iter()
        .map(|r| r.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);

    // rolling back the head restores the prior version
    rollback_migration(&mut conn, &V3).unwrap();
    assert_eq!(current_version(&conn).unwrap(), 2);

    // and it can be re-applied
    apply_migration(&mut conn, &V3).unwrap();
    assert_eq!(current_version(&conn).unwrap(), 3);
}

#[test]
fn crash_mid_sequence_leaves_prior_version_authoritative() {
    let dir = TempDir::new().unwrap();
    let config = file_config(&dir);
    let mut conn = db::open_connection(&config).unwrap();
    initialize_schema(&mut conn).unwrap();

    const GOOD: Migration = Migration {
        version: 2,
        description: "good",
        up: &["CREATE TABLE survived (id TEXT PRIMARY KEY)"],
        down: &["DROP TABLE survived"],
    };
    const BAD: Migration = Migration {
        version: 3,
        description: "bad",
        up: &["CREATE TABLE broken (id TEXT"],
        down: &[],
    };

    assert!(run_migrations(&mut conn, &[GOOD, BAD]).is_err());
    drop(conn);

    // a fresh connection to the same file sees version 2, not 3
    let conn = db::open_connection(&config).unwrap();
    assert_eq!(current_version(&conn).unwrap(), 2);
    let broken_exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='broken'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(broken_exists, 0);
}
