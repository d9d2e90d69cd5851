//! SQL DDL for the engram tables.
//!
//! Schema v1 defines `schema_migrations`, `rules`, `project_docs`, and
//! `refs`, the scoped-listing indexes, and one `AFTER UPDATE` trigger per
//! row table. The triggers are guarded so application writes that carry
//! their own fresh `updated_at` are left alone, while direct SQL edits that
//! never touch the column still get bumped to `CURRENT_TIMESTAMP`.

/// The schema version that the current binary expects.
pub const SCHEMA_VERSION: i64 = 1;

/// All v1 DDL, applied in one transaction by
/// [`initialize_schema`](crate::db::migrations::initialize_schema).
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    description TEXT
);

-- Unscoped policy statements, classified by tier
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    embedding BLOB,
    tags TEXT NOT NULL DEFAULT '[]',
    tier INTEGER CHECK(tier BETWEEN 1 AND 5),
    metadata TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Documents grouped (but not FK-bound) by project
CREATE TABLE IF NOT EXISTS project_docs (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    file_path TEXT,
    embedding BLOB,
    tags TEXT NOT NULL DEFAULT '[]',
    metadata TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Named lookups, optionally scoped to a channel
CREATE TABLE IF NOT EXISTS refs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    channel_id TEXT,
    metadata TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_rules_tier ON rules(tier);
CREATE INDEX IF NOT EXISTS idx_rules_created_at ON rules(created_at);
CREATE INDEX IF NOT EXISTS idx_rules_updated_at ON rules(updated_at);
CREATE INDEX IF NOT EXISTS idx_project_docs_project_id ON project_docs(project_id);
CREATE INDEX IF NOT EXISTS idx_project_docs_created_at ON project_docs(created_at);
CREATE INDEX IF NOT EXISTS idx_project_docs_updated_at ON project_docs(updated_at);
CREATE INDEX IF NOT EXISTS idx_refs_channel_id ON refs(channel_id);
CREATE INDEX IF NOT EXISTS idx_refs_name ON refs(name);
CREATE INDEX IF NOT EXISTS idx_refs_created_at ON refs(created_at);
CREATE INDEX IF NOT EXISTS idx_refs_updated_at ON refs(updated_at);

CREATE TRIGGER IF NOT EXISTS trg_rules_updated_at
AFTER UPDATE ON rules
FOR EACH ROW
WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE rules SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_project_docs_updated_at
AFTER UPDATE ON project_docs
FOR EACH ROW
WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE project_docs SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_refs_updated_at
AFTER UPDATE ON refs
FOR EACH ROW
WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE refs SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;
"#;

/// A versioned, transactional schema change.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up: &'static [&'static str],
    pub down: &'static [&'static str],
}

/// Migrations beyond the v1 baseline, ascending by version. Currently none;
/// follow-on changes (e.g. a `UNIQUE(refs.name)` constraint or a tag join
/// table) append here.
pub const MIGRATIONS: &[Migration] = &[];
