//! CRUD and scoped listings for rules.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::store::types::{ListOptions, NewRule, Rule, RulePatch};
use crate::store::{
    decode_embedding, decode_metadata, decode_tags, encode_metadata, encode_tags, new_id,
    now_rfc3339, validate_tier,
};

const COLUMNS: &str = "id, content, embedding, tags, tier, metadata, created_at, updated_at";

pub struct RuleStore<'a> {
    conn: &'a Connection,
}

impl<'a> RuleStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Insert a rule with both timestamps set to now. Returns the stored
    /// record. The embedding column is left NULL for the vector index.
    pub fn create(&self, input: &NewRule) -> Result<Rule> {
        validate_tier(input.tier)?;
        let id = new_id(input.id.as_ref());
        let tags_json = encode_tags(&input.tags)?;
        let metadata_json = encode_metadata(input.metadata.as_ref())?;
        let now = now_rfc3339();

        self.conn.execute(
            "INSERT INTO rules (id, content, tags, tier, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, input.content, tags_json, input.tier, metadata_json, now],
        )?;

        Ok(Rule {
            id,
            content: input.content.clone(),
            tags: input.tags.clone(),
            tier: input.tier,
            metadata: input.metadata.clone(),
            embedding: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Rule>> {
        let rule = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM rules WHERE id = ?1"),
                params![id],
                map_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// Read-modify-write. Returns `None` when no row exists; otherwise the
    /// merged record with a fresh `updated_at`.
    pub fn update(&self, id: &str, patch: &RulePatch) -> Result<Option<Rule>> {
        let Some(mut rule) = self.find_by_id(id)? else {
            return Ok(None);
        };

        if let Some(content) = &patch.content {
            rule.content = content.clone();
        }
        if let Some(tags) = &patch.tags {
            rule.tags = tags.clone();
        }
        if let Some(tier) = patch.tier {
            validate_tier(tier)?;
            rule.tier = tier;
        }
        if let Some(metadata) = &patch.metadata {
            rule.metadata = Some(metadata.clone());
        }
        rule.updated_at = now_rfc3339();

        let tags_json = encode_tags(&rule.tags)?;
        let metadata_json = encode_metadata(rule.metadata.as_ref())?;
        self.conn.execute(
            "UPDATE rules SET content = ?1, tags = ?2, tier = ?3, metadata = ?4, updated_at = ?5 \
             WHERE id = ?6",
            params![rule.content, tags_json, rule.tier, metadata_json, rule.updated_at, id],
        )?;

        Ok(Some(rule))
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM rules WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn list(&self, opts: &ListOptions) -> Result<Vec<Rule>> {
        let (limit, offset) = opts.page();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM rules ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let rules = stmt
            .query_map(params![limit, offset], map_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn find_by_tier(&self, tier: u8, opts: &ListOptions) -> Result<Vec<Rule>> {
        let (limit, offset) = opts.page();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM rules WHERE tier = ?1 \
             ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rules = stmt
            .query_map(params![tier, limit, offset], map_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    /// OR-match rules whose JSON tags contain any of the given literals.
    /// Substring match on the encoded form, so tags with `"` are rejected
    /// at the write boundary.
    pub fn find_by_tags(&self, tags: &[String], opts: &ListOptions) -> Result<Vec<Rule>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let clauses: Vec<String> = (1..=tags.len())
            .map(|i| format!("tags LIKE ?{i}"))
            .collect();
        let (limit, offset) = opts.page();
        let sql = format!(
            "SELECT {COLUMNS} FROM rules WHERE {} ORDER BY updated_at DESC LIMIT ?{} OFFSET ?{}",
            clauses.join(" OR "),
            tags.len() + 1,
            tags.len() + 2,
        );

        let patterns: Vec<String> = tags.iter().map(|t| format!("%\"{t}\"%")).collect();
        let mut bindings: Vec<&dyn rusqlite::types::ToSql> = patterns
            .iter()
            .map(|p| p as &dyn rusqlite::types::ToSql)
            .collect();
        bindings.push(&limit);
        bindings.push(&offset);

        let mut stmt = self.conn.prepare(&sql)?;
        let rules = stmt
            .query_map(bindings.as_slice(), map_rule)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rules)
    }
}

fn map_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let blob: Option<Vec<u8>> = row.get(2)?;
    let tags_raw: String = row.get(3)?;
    let metadata_raw: Option<String> = row.get(5)?;
    Ok(Rule {
        id: row.get(0)?,
        content: row.get(1)?,
        embedding: decode_embedding(blob),
        tags: decode_tags(&tags_raw),
        tier: row.get(4)?,
        metadata: decode_metadata(metadata_raw),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
