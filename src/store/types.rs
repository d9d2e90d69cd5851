//! Persisted entity types and their write-side inputs.
//!
//! Defines the three artifact kinds ([`Rule`], [`ProjectDoc`], [`RefEntry`]),
//! the [`EntityKind`] table tag, and [`SearchResult`] rows returned by
//! semantic search. Inputs (`New*`) and partial updates (`*Patch`) keep the
//! write surface explicit.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The three persisted artifact kinds, doubling as the table allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Rule,
    ProjectDoc,
    Ref,
}

impl EntityKind {
    /// Scan order for cross-table search: rules, project_docs, refs.
    pub const ALL: [EntityKind; 3] = [EntityKind::Rule, EntityKind::ProjectDoc, EntityKind::Ref];

    /// The backing table name.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Rule => "rules",
            Self::ProjectDoc => "project_docs",
            Self::Ref => "refs",
        }
    }

    /// Tag used in search results and cache key namespaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::ProjectDoc => "project_doc",
            Self::Ref => "ref",
        }
    }

    /// Resolve a caller-supplied table name against the allowlist.
    pub fn from_table(name: &str) -> Result<Self> {
        match name {
            "rules" => Ok(Self::Rule),
            "project_docs" => Ok(Self::ProjectDoc),
            "refs" => Ok(Self::Ref),
            other => Err(Error::UnknownTable(other.to_string())),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unscoped policy statement with a 1–5 tier classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub content: String,
    pub tags: Vec<String>,
    /// Closed small-integer classification, 1 (highest) through 5.
    pub tier: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-modification timestamp.
    pub updated_at: String,
}

/// A document grouped by `project_id` (indexed, not a foreign key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
    pub updated_at: String,
}

/// A named lookup, optionally scoped to a channel. Name uniqueness is
/// caller discipline, not a schema constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefEntry {
    pub id: String,
    pub name: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: String,
    pub updated_at: String,
}

/// One row from a semantic similarity scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub content: String,
    #[serde(rename = "similarity_score")]
    pub similarity: f32,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Input for creating a rule. `id` defaults to a fresh UUID v7; the
/// embedding is written by the vector index, not row storage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRule {
    pub id: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub tier: u8,
    pub metadata: Option<serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulePatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub tier: Option<u8>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProjectDoc {
    pub id: Option<String>,
    pub project_id: String,
    pub title: String,
    pub content: String,
    pub file_path: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectDocPatch {
    pub project_id: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub file_path: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewRef {
    pub id: Option<String>,
    pub name: String,
    pub content: String,
    pub channel_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefPatch {
    pub name: Option<String>,
    pub content: Option<String>,
    pub channel_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Paging for listings and scoped finders. Defaults: limit 50, offset 0,
/// ordered by `updated_at` descending.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListOptions {
    pub(crate) fn page(&self) -> (i64, i64) {
        (
            self.limit.unwrap_or(50) as i64,
            self.offset.unwrap_or(0) as i64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_table_mapping() {
        assert_eq!(EntityKind::Rule.table(), "rules");
        assert_eq!(EntityKind::ProjectDoc.table(), "project_docs");
        assert_eq!(EntityKind::Ref.table(), "refs");
    }

    #[test]
    fn kind_from_table_rejects_unknown() {
        assert_eq!(EntityKind::from_table("rules").unwrap(), EntityKind::Rule);
        assert!(matches!(
            EntityKind::from_table("memories"),
            Err(Error::UnknownTable(_))
        ));
    }

    #[test]
    fn search_result_serializes_with_renamed_fields() {
        let result = SearchResult {
            id: "r1".into(),
            content: "x".into(),
            similarity: 0.9,
            kind: EntityKind::ProjectDoc,
            metadata: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "project_doc");
        assert!((json["similarity_score"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn list_options_defaults() {
        assert_eq!(ListOptions::default().page(), (50, 0));
        let opts = ListOptions {
            limit: Some(5),
            offset: Some(10),
        };
        assert_eq!(opts.page(), (5, 10));
    }
}
