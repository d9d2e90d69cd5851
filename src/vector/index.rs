//! Per-row embedding persistence and brute-force semantic search.
//!
//! Embeddings live on the row they annotate and share its lifecycle.
//! Search is an exact linear scan: every row with a non-NULL embedding is
//! decoded and scored with cosine similarity, candidates at or above the
//! threshold are ranked descending, and the top K returned. O(N·d) per
//! query, zero staleness, no index build.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::decode_metadata;
use crate::store::types::{EntityKind, SearchResult};
use crate::vector::{
    check_dimensions, cosine_similarity, deserialize_embedding, is_valid, serialize_embedding,
};

/// Knobs for a similarity scan.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub threshold: f32,
    pub include_metadata: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: 0.7,
            include_metadata: true,
        }
    }
}

/// One embedding destined for a row, used by batch writes.
#[derive(Debug, Clone)]
pub struct EmbeddingWrite {
    pub kind: EntityKind,
    pub id: String,
    pub embedding: Vec<f32>,
}

/// Per-table and total embedding coverage.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableStats {
    pub total: u64,
    pub embedded: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexStats {
    pub rules: TableStats,
    pub project_docs: TableStats,
    pub refs: TableStats,
    pub total: u64,
    pub total_embedded: u64,
}

/// Vector access bound to one borrowed connection. Ephemeral per call, like
/// the row stores.
pub struct VectorIndex<'a> {
    conn: &'a Connection,
    dimensions: usize,
}

impl<'a> VectorIndex<'a> {
    pub fn new(conn: &'a Connection, dimensions: usize) -> Self {
        Self { conn, dimensions }
    }

    /// Persist an embedding on its row. Returns whether the row existed.
    /// The vector must match the configured dimension and be fully finite.
    pub fn store_embedding(&self, kind: EntityKind, id: &str, embedding: &[f32]) -> Result<bool> {
        self.validate(embedding)?;
        let blob = serialize_embedding(embedding);
        let rows = self.conn.execute(
            &format!("UPDATE {} SET embedding = ?1 WHERE id = ?2", kind.table()),
            params![blob, id],
        )?;
        Ok(rows > 0)
    }

    /// The stored vector, or `None` when the row is missing or the column
    /// is NULL.
    pub fn get_embedding(&self, kind: EntityKind, id: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                &format!("SELECT embedding FROM {} WHERE id = ?1", kind.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match blob.flatten() {
            Some(bytes) => Ok(Some(deserialize_embedding(&bytes)?)),
            None => Ok(None),
        }
    }

    /// NULL the embedding column in one table, or all three.
    pub fn clear_embeddings(&self, kind: Option<EntityKind>) -> Result<u64> {
        let kinds: &[EntityKind] = match &kind {
            Some(k) => std::slice::from_ref(k),
            None => &EntityKind::ALL,
        };
        let mut cleared = 0u64;
        for k in kinds {
            cleared += self.conn.execute(
                &format!("UPDATE {} SET embedding = NULL", k.table()),
                [],
            )? as u64;
        }
        Ok(cleared)
    }

    /// Row and embedding counts per table, plus grand totals.
    pub fn stats(&self) -> Result<IndexStats> {
        let rules = self.table_stats(EntityKind::Rule)?;
        let project_docs = self.table_stats(EntityKind::ProjectDoc)?;
        let refs = self.table_stats(EntityKind::Ref)?;
        let total = rules.total + project_docs.total + refs.total;
        let total_embedded = rules.embedded + project_docs.embedded + refs.embedded;
        Ok(IndexStats {
            rules,
            project_docs,
            refs,
            total,
            total_embedded,
        })
    }

    fn table_stats(&self, kind: EntityKind) -> Result<TableStats> {
        let (total, embedded): (i64, i64) = self.conn.query_row(
            &format!(
                "SELECT COUNT(*), COUNT(embedding) FROM {}",
                kind.table()
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(TableStats {
            total: total as u64,
            embedded: embedded as u64,
        })
    }

    /// Thresholded top-K scan across all three tables, in the fixed order
    /// rules, project_docs, refs. Ties keep scan order.
    pub fn semantic_search(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<SearchResult>> {
        check_dimensions(query, self.dimensions)?;
        let mut candidates = Vec::new();
        for kind in EntityKind::ALL {
            self.scan_table(kind, query, opts, &mut candidates)?;
        }
        rank(&mut candidates, opts.limit);
        Ok(candidates)
    }

    /// Same contract as [`semantic_search`](Self::semantic_search), one table.
    pub fn search_in_table(
        &self,
        kind: EntityKind,
        query: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        check_dimensions(query, self.dimensions)?;
        let mut candidates = Vec::new();
        self.scan_table(kind, query, opts, &mut candidates)?;
        rank(&mut candidates, opts.limit);
        Ok(candidates)
    }

    /// Rows similar to a stored one, excluding the row itself. Empty when
    /// the row is missing or has no embedding.
    pub fn find_similar(
        &self,
        kind: EntityKind,
        id: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let Some(query) = self.get_embedding(kind, id)? else {
            return Ok(Vec::new());
        };
        // scan one past the limit so excluding the row cannot shrink a
        // full page
        let scan_opts = SearchOptions {
            limit: opts.limit.saturating_add(1),
            ..opts.clone()
        };
        let mut results = self.semantic_search(&query, &scan_opts)?;
        results.retain(|r| !(r.kind == kind && r.id == id));
        results.truncate(opts.limit);
        Ok(results)
    }

    fn scan_table(
        &self,
        kind: EntityKind,
        query: &[f32],
        opts: &SearchOptions,
        out: &mut Vec<SearchResult>,
    ) -> Result<()> {
        let sql = if opts.include_metadata {
            format!(
                "SELECT id, content, embedding, metadata FROM {} WHERE embedding IS NOT NULL",
                kind.table()
            )
        } else {
            format!(
                "SELECT id, content, embedding, NULL FROM {} WHERE embedding IS NOT NULL",
                kind.table()
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        for row in rows {
            let (id, content, blob, metadata_raw) = row?;
            let embedding = match deserialize_embedding(&blob) {
                Ok(v) => v,
                Err(e) => {
                    warn!(table = kind.table(), id = %id, error = %e, "skipping undecodable embedding");
                    continue;
                }
            };
            if embedding.len() != query.len() {
                warn!(
                    table = kind.table(),
                    id = %id,
                    stored = embedding.len(),
                    query = query.len(),
                    "skipping embedding with mismatched dimension"
                );
                continue;
            }
            let similarity = cosine_similarity(query, &embedding)?;
            if similarity >= opts.threshold {
                out.push(SearchResult {
                    id,
                    content,
                    similarity,
                    kind,
                    metadata: if opts.include_metadata {
                        decode_metadata(metadata_raw)
                    } else {
                        None
                    },
                });
            }
        }
        Ok(())
    }

    fn validate(&self, embedding: &[f32]) -> Result<()> {
        check_dimensions(embedding, self.dimensions)?;
        if !is_valid(embedding) {
            return Err(Error::InvalidEmbedding(
                "embedding contains non-finite values".into(),
            ));
        }
        Ok(())
    }
}

/// Stable-sort candidates by similarity descending and keep the first
/// `limit`. Stability preserves table and row scan order among ties.
fn rank(candidates: &mut Vec<SearchResult>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(limit);
}

/// Apply all writes in a single transaction; any failure rolls the whole
/// batch back.
pub fn batch_store_embeddings(
    conn: &mut Connection,
    dimensions: usize,
    writes: &[EmbeddingWrite],
) -> Result<usize> {
    let tx = conn.transaction()?;
    {
        let index = VectorIndex::new(&tx, dimensions);
        for write in writes {
            index.store_embedding(write.kind, &write.id, &write.embedding)?;
        }
    }
    tx.commit()?;
    Ok(writes.len())
}
