//! The memory service facade.
//!
//! Composes the pool, cache, row stores, and vector index behind one
//! operational API. This is the only place the cache and the pool meet:
//! identity reads are cache-aside with positive-only population, writes go
//! through the pool and then update or evict their cache entries, and
//! search results are cached under a fingerprint of the query vector and
//! options. Every public operation checks out a connection via the pool
//! and builds its storage helpers against that handle.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, MemoryCache};
use crate::config::EngramConfig;
use crate::db;
use crate::db::migrations;
use crate::db::pool::{with_transaction, ConnectionPool, PoolStats};
use crate::db::schema::MIGRATIONS;
use crate::error::{Error, Result};
use crate::store::docs::DocStore;
use crate::store::refs::RefStore;
use crate::store::rules::RuleStore;
use crate::store::types::{
    EntityKind, ListOptions, NewProjectDoc, NewRef, NewRule, ProjectDoc, ProjectDocPatch, RefEntry,
    RefPatch, Rule, RulePatch, SearchResult,
};
use crate::vector;
use crate::vector::index::{
    batch_store_embeddings, EmbeddingWrite, IndexStats, SearchOptions, VectorIndex,
};

/// Tagged union stored in the cache; one namespace per kind plus search
/// results.
#[derive(Debug, Clone)]
enum CachedValue {
    Rule(Rule),
    Doc(ProjectDoc),
    Ref(RefEntry),
    Search(Vec<SearchResult>),
}

/// Semantic search request accepted by the facade. Scoping filters are
/// applied after the scan; a provided filter excludes kinds that cannot
/// satisfy it (e.g. refs under a `tier` filter).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub limit: Option<usize>,
    pub threshold: Option<f32>,
    pub include_metadata: Option<bool>,
    pub project_id: Option<String>,
    pub channel_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub tier: Option<u8>,
}

impl SearchRequest {
    fn options(&self) -> SearchOptions {
        let defaults = SearchOptions::default();
        SearchOptions {
            limit: self.limit.unwrap_or(defaults.limit),
            threshold: self.threshold.unwrap_or(defaults.threshold),
            include_metadata: self.include_metadata.unwrap_or(defaults.include_metadata),
        }
    }

    fn has_filters(&self) -> bool {
        self.project_id.is_some()
            || self.channel_id.is_some()
            || self.tags.is_some()
            || self.tier.is_some()
    }
}

/// Listing parameters for rules.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRules {
    pub tier: Option<u8>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Listing parameters for project docs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListDocs {
    pub project_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Listing parameters for refs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRefs {
    pub channel_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Aggregated snapshot from [`MemoryService::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub cache: CacheStats,
    pub index: IndexStats,
}

pub struct MemoryService {
    config: EngramConfig,
    cache: MemoryCache<CachedValue>,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
}

impl MemoryService {
    /// Build an uninitialized service. No connections are opened until
    /// [`initialize`](Self::initialize).
    pub fn new(config: EngramConfig) -> Self {
        let cache = MemoryCache::new(
            config.cache.max_size,
            config.cache.ttl(),
            config.cache.update_age_on_get,
        )
        .with_eviction_hook(Box::new(|key, _value: &CachedValue| {
            debug!(key, "cache entry evicted");
        }));
        Self {
            config,
            cache,
            pool: RwLock::new(None),
        }
    }

    /// Bring up the pool and the schema. Calling twice logs a warning and
    /// returns without touching anything.
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.pool.write().expect("service lock poisoned");
        if slot.is_some() {
            warn!("memory service already initialized");
            return Ok(());
        }

        let pool = ConnectionPool::new(self.config.database.clone());
        pool.with_connection(|conn| {
            migrations::initialize_schema(conn)?;
            migrations::run_migrations(conn, MIGRATIONS)
        })?;
        *slot = Some(pool);

        info!(
            url = %self.config.database.url,
            dimensions = self.config.vector.dimensions,
            "memory service initialized"
        );
        Ok(())
    }

    /// Close the pool. Subsequent operations fail with `NotInitialized`.
    pub fn shutdown(&self) {
        let pool = self.pool.write().expect("service lock poisoned").take();
        if let Some(pool) = pool {
            pool.shutdown();
            info!("memory service shut down");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pool.read().expect("service lock poisoned").is_some()
    }

    fn pool(&self) -> Result<Arc<ConnectionPool>> {
        self.pool
            .read()
            .expect("service lock poisoned")
            .clone()
            .ok_or(Error::NotInitialized)
    }

    fn dimensions(&self) -> usize {
        self.config.vector.dimensions
    }

    // ── Rules ─────────────────────────────────────────────────────────────

    /// Create a rule; when the input carries an embedding, the row and its
    /// vector commit in one transaction.
    pub fn create_rule(&self, input: NewRule) -> Result<Rule> {
        let pool = self.pool()?;
        let dimensions = self.dimensions();
        let rule = pool.with_connection(|conn| {
            with_transaction(conn, |tx| {
                let mut rule = RuleStore::new(tx).create(&input)?;
                if let Some(embedding) = &input.embedding {
                    VectorIndex::new(tx, dimensions).store_embedding(
                        EntityKind::Rule,
                        &rule.id,
                        embedding,
                    )?;
                    rule.embedding = Some(embedding.clone());
                }
                Ok(rule)
            })
        })?;
        self.cache
            .set(&format!("rule:{}", rule.id), CachedValue::Rule(rule.clone()));
        Ok(rule)
    }

    pub fn get_rule(&self, id: &str) -> Result<Option<Rule>> {
        let pool = self.pool()?;
        let key = format!("rule:{id}");
        if let Some(CachedValue::Rule(rule)) = self.cache.get(&key) {
            return Ok(Some(rule));
        }
        let found = pool.with_connection(|conn| RuleStore::new(conn).find_by_id(id))?;
        if let Some(rule) = &found {
            self.cache.set(&key, CachedValue::Rule(rule.clone()));
        }
        Ok(found)
    }

    pub fn update_rule(&self, id: &str, patch: RulePatch) -> Result<Option<Rule>> {
        let pool = self.pool()?;
        let updated = pool.with_connection(|conn| RuleStore::new(conn).update(id, &patch))?;
        if let Some(rule) = &updated {
            self.cache
                .set(&format!("rule:{id}"), CachedValue::Rule(rule.clone()));
        }
        Ok(updated)
    }

    pub fn delete_rule(&self, id: &str) -> Result<bool> {
        let pool = self.pool()?;
        let deleted = pool.with_connection(|conn| RuleStore::new(conn).delete(id))?;
        if deleted {
            self.cache.delete(&format!("rule:{id}"));
        }
        Ok(deleted)
    }

    pub fn list_rules(&self, params: ListRules) -> Result<Vec<Rule>> {
        let pool = self.pool()?;
        let opts = ListOptions {
            limit: params.limit,
            offset: params.offset,
        };
        pool.with_connection(|conn| {
            let store = RuleStore::new(conn);
            match params.tier {
                Some(tier) => store.find_by_tier(tier, &opts),
                None => store.list(&opts),
            }
        })
    }

    pub fn find_rules_by_tags(&self, tags: &[String]) -> Result<Vec<Rule>> {
        let pool = self.pool()?;
        pool.with_connection(|conn| {
            RuleStore::new(conn).find_by_tags(tags, &ListOptions::default())
        })
    }

    // ── Project docs ──────────────────────────────────────────────────────

    pub fn create_doc(&self, input: NewProjectDoc) -> Result<ProjectDoc> {
        let pool = self.pool()?;
        let dimensions = self.dimensions();
        let doc = pool.with_connection(|conn| {
            with_transaction(conn, |tx| {
                let mut doc = DocStore::new(tx).create(&input)?;
                if let Some(embedding) = &input.embedding {
                    VectorIndex::new(tx, dimensions).store_embedding(
                        EntityKind::ProjectDoc,
                        &doc.id,
                        embedding,
                    )?;
                    doc.embedding = Some(embedding.clone());
                }
                Ok(doc)
            })
        })?;
        self.cache.set(
            &format!("project_doc:{}", doc.id),
            CachedValue::Doc(doc.clone()),
        );
        Ok(doc)
    }

    pub fn get_doc(&self, id: &str) -> Result<Option<ProjectDoc>> {
        let pool = self.pool()?;
        let key = format!("project_doc:{id}");
        if let Some(CachedValue::Doc(doc)) = self.cache.get(&key) {
            return Ok(Some(doc));
        }
        let found = pool.with_connection(|conn| DocStore::new(conn).find_by_id(id))?;
        if let Some(doc) = &found {
            self.cache.set(&key, CachedValue::Doc(doc.clone()));
        }
        Ok(found)
    }

    pub fn update_doc(&self, id: &str, patch: ProjectDocPatch) -> Result<Option<ProjectDoc>> {
        let pool = self.pool()?;
        let updated = pool.with_connection(|conn| DocStore::new(conn).update(id, &patch))?;
        if let Some(doc) = &updated {
            self.cache
                .set(&format!("project_doc:{id}"), CachedValue::Doc(doc.clone()));
        }
        Ok(updated)
    }

    pub fn delete_doc(&self, id: &str) -> Result<bool> {
        let pool = self.pool()?;
        let deleted = pool.with_connection(|conn| DocStore::new(conn).delete(id))?;
        if deleted {
            self.cache.delete(&format!("project_doc:{id}"));
        }
        Ok(deleted)
    }

    pub fn list_docs(&self, params: ListDocs) -> Result<Vec<ProjectDoc>> {
        let pool = self.pool()?;
        let opts = ListOptions {
            limit: params.limit,
            offset: params.offset,
        };
        pool.with_connection(|conn| {
            let store = DocStore::new(conn);
            match &params.project_id {
                Some(project_id) => store.find_by_project_id(project_id, &opts),
                None => store.list(&opts),
            }
        })
    }

    // ── Refs ──────────────────────────────────────────────────────────────

    pub fn create_ref(&self, input: NewRef) -> Result<RefEntry> {
        let pool = self.pool()?;
        let dimensions = self.dimensions();
        let entry = pool.with_connection(|conn| {
            with_transaction(conn, |tx| {
                let mut entry = RefStore::new(tx).create(&input)?;
                if let Some(embedding) = &input.embedding {
                    VectorIndex::new(tx, dimensions).store_embedding(
                        EntityKind::Ref,
                        &entry.id,
                        embedding,
                    )?;
                    entry.embedding = Some(embedding.clone());
                }
                Ok(entry)
            })
        })?;
        self.cache
            .set(&format!("ref:{}", entry.id), CachedValue::Ref(entry.clone()));
        self.cache.set(
            &format!("ref:name:{}", entry.name),
            CachedValue::Ref(entry.clone()),
        );
        Ok(entry)
    }

    pub fn get_ref(&self, id: &str) -> Result<Option<RefEntry>> {
        let pool = self.pool()?;
        let key = format!("ref:{id}");
        if let Some(CachedValue::Ref(entry)) = self.cache.get(&key) {
            return Ok(Some(entry));
        }
        let found = pool.with_connection(|conn| RefStore::new(conn).find_by_id(id))?;
        if let Some(entry) = &found {
            self.cache.set(&key, CachedValue::Ref(entry.clone()));
        }
        Ok(found)
    }

    /// Name-keyed lookup. A database hit populates both the name key and
    /// the id key.
    pub fn get_ref_by_name(&self, name: &str) -> Result<Option<RefEntry>> {
        let pool = self.pool()?;
        let name_key = format!("ref:name:{name}");
        if let Some(CachedValue::Ref(entry)) = self.cache.get(&name_key) {
            return Ok(Some(entry));
        }
        let found = pool.with_connection(|conn| RefStore::new(conn).find_by_name(name))?;
        if let Some(entry) = &found {
            self.cache
                .set(&format!("ref:{}", entry.id), CachedValue::Ref(entry.clone()));
            self.cache.set(&name_key, CachedValue::Ref(entry.clone()));
        }
        Ok(found)
    }

    pub fn update_ref(&self, id: &str, patch: RefPatch) -> Result<Option<RefEntry>> {
        let pool = self.pool()?;
        let (before, updated) = pool.with_connection(|conn| {
            let store = RefStore::new(conn);
            let before = store.find_by_id(id)?;
            let updated = store.update(id, &patch)?;
            Ok((before, updated))
        })?;
        if let Some(entry) = &updated {
            self.cache
                .set(&format!("ref:{id}"), CachedValue::Ref(entry.clone()));
            self.cache.set(
                &format!("ref:name:{}", entry.name),
                CachedValue::Ref(entry.clone()),
            );
            // a rename leaves the old name key stale
            if let Some(before) = &before {
                if before.name != entry.name {
                    self.cache.delete(&format!("ref:name:{}", before.name));
                }
            }
        }
        Ok(updated)
    }

    pub fn delete_ref(&self, id: &str) -> Result<bool> {
        let pool = self.pool()?;
        let (before, deleted) = pool.with_connection(|conn| {
            let store = RefStore::new(conn);
            let before = store.find_by_id(id)?;
            let deleted = store.delete(id)?;
            Ok((before, deleted))
        })?;
        if deleted {
            self.cache.delete(&format!("ref:{id}"));
            if let Some(entry) = before {
                self.cache.delete(&format!("ref:name:{}", entry.name));
            }
        }
        Ok(deleted)
    }

    pub fn list_refs(&self, params: ListRefs) -> Result<Vec<RefEntry>> {
        let pool = self.pool()?;
        let opts = ListOptions {
            limit: params.limit,
            offset: params.offset,
        };
        pool.with_connection(|conn| {
            let store = RefStore::new(conn);
            match &params.channel_id {
                Some(channel_id) => store.find_by_channel_id(channel_id, &opts),
                None => store.list(&opts),
            }
        })
    }

    // ── Search and embeddings ─────────────────────────────────────────────

    /// Thresholded top-K similarity search across all three kinds, with
    /// optional scoping filters. Results are cached under a SHA-256
    /// fingerprint of the full query vector and options.
    pub fn semantic_search(&self, query: &[f32], request: SearchRequest) -> Result<Vec<SearchResult>> {
        let pool = self.pool()?;
        vector::check_dimensions(query, self.dimensions())?;

        let cache_key = search_cache_key(query, &request);
        if let Some(CachedValue::Search(results)) = self.cache.get(&cache_key) {
            return Ok(results);
        }

        let opts = request.options();
        let dimensions = self.dimensions();
        let results = pool.with_connection(|conn| {
            let index = VectorIndex::new(conn, dimensions);
            if !request.has_filters() {
                return index.semantic_search(query, &opts);
            }
            // scan unbounded so post-filtering cannot starve the page
            let scan_opts = SearchOptions {
                limit: usize::MAX,
                ..opts.clone()
            };
            let candidates = index.semantic_search(query, &scan_opts)?;
            let mut out = Vec::with_capacity(opts.limit.min(candidates.len()));
            for candidate in candidates {
                if passes_filters(conn, &candidate, &request)? {
                    out.push(candidate);
                    if out.len() >= opts.limit {
                        break;
                    }
                }
            }
            Ok(out)
        })?;

        self.cache
            .set(&cache_key, CachedValue::Search(results.clone()));
        Ok(results)
    }

    /// Single-table scan with the same semantics as
    /// [`semantic_search`](Self::semantic_search), minus filters.
    pub fn search_in_table(
        &self,
        table: &str,
        query: &[f32],
        request: SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        let pool = self.pool()?;
        let kind = EntityKind::from_table(table)?;
        let opts = request.options();
        let dimensions = self.dimensions();
        pool.with_connection(|conn| {
            VectorIndex::new(conn, dimensions).search_in_table(kind, query, &opts)
        })
    }

    /// Rows similar to a stored one, excluding the row itself.
    pub fn find_similar(
        &self,
        table: &str,
        id: &str,
        request: SearchRequest,
    ) -> Result<Vec<SearchResult>> {
        let pool = self.pool()?;
        let kind = EntityKind::from_table(table)?;
        let opts = request.options();
        let dimensions = self.dimensions();
        pool.with_connection(|conn| {
            VectorIndex::new(conn, dimensions).find_similar(kind, id, &opts)
        })
    }

    /// Write many embeddings in one transaction and evict the id-keyed
    /// cache entry of every row touched.
    pub fn batch_store_embeddings(&self, writes: Vec<EmbeddingWrite>) -> Result<usize> {
        let pool = self.pool()?;
        let dimensions = self.dimensions();
        let count =
            pool.with_connection(|conn| batch_store_embeddings(conn, dimensions, &writes))?;
        for write in &writes {
            self.cache
                .delete(&format!("{}:{}", write.kind.as_str(), write.id));
        }
        Ok(count)
    }

    // ── Introspection ─────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<ServiceStats> {
        let pool = self.pool()?;
        let dimensions = self.dimensions();
        let index = pool.with_connection(|conn| VectorIndex::new(conn, dimensions).stats())?;
        Ok(ServiceStats {
            pool: pool.stats(),
            cache: self.cache.stats(),
            index,
        })
    }

    pub fn health_check(&self) -> Result<db::HealthReport> {
        let pool = self.pool()?;
        pool.with_connection(|conn| db::check_database_health(conn))
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// Does a candidate survive the request's scoping filters? Each provided
/// filter restricts; kinds without the filtered attribute are excluded.
fn passes_filters(
    conn: &rusqlite::Connection,
    candidate: &SearchResult,
    request: &SearchRequest,
) -> Result<bool> {
    match candidate.kind {
        EntityKind::Rule => {
            if request.project_id.is_some() || request.channel_id.is_some() {
                return Ok(false);
            }
            if request.tier.is_none() && request.tags.is_none() {
                return Ok(true);
            }
            let Some(rule) = RuleStore::new(conn).find_by_id(&candidate.id)? else {
                return Ok(false);
            };
            if let Some(tier) = request.tier {
                if rule.tier != tier {
                    return Ok(false);
                }
            }
            if let Some(tags) = &request.tags {
                if !tags.iter().any(|t| rule.tags.contains(t)) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        EntityKind::ProjectDoc => {
            if request.channel_id.is_some() || request.tier.is_some() {
                return Ok(false);
            }
            if request.project_id.is_none() && request.tags.is_none() {
                return Ok(true);
            }
            let Some(doc) = DocStore::new(conn).find_by_id(&candidate.id)? else {
                return Ok(false);
            };
            if let Some(project_id) = &request.project_id {
                if &doc.project_id != project_id {
                    return Ok(false);
                }
            }
            if let Some(tags) = &request.tags {
                if !tags.iter().any(|t| doc.tags.contains(t)) {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        EntityKind::Ref => {
            if request.project_id.is_some()
                || request.tier.is_some()
                || request.tags.is_some()
            {
                return Ok(false);
            }
            let Some(channel_id) = &request.channel_id else {
                return Ok(true);
            };
            let Some(entry) = RefStore::new(conn).find_by_id(&candidate.id)? else {
                return Ok(false);
            };
            Ok(entry.channel_id.as_ref() == Some(channel_id))
        }
    }
}

/// Cache key for a search: SHA-256 over the full query vector bytes and a
/// canonical rendering of the options. Wide on purpose: a truncated
/// fingerprint collides across nearby queries.
fn search_cache_key(query: &[f32], request: &SearchRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(vector::serialize_embedding(query));
    hasher.update(format!(
        "|limit={:?}|threshold={:?}|meta={:?}|project={:?}|channel={:?}|tags={:?}|tier={:?}",
        request.limit,
        request.threshold,
        request.include_metadata,
        request.project_id,
        request.channel_id,
        request.tags,
        request.tier,
    ));
    format!("search:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec_of(seed: usize, dims: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dims];
        v[seed % dims] = 1.0;
        v
    }

    #[test]
    fn search_cache_key_is_stable_and_distinguishes() {
        let q = vec_of(0, 8);
        let request = SearchRequest::default();
        assert_eq!(
            search_cache_key(&q, &request),
            search_cache_key(&q, &request)
        );

        let other_query = vec_of(1, 8);
        assert_ne!(
            search_cache_key(&q, &request),
            search_cache_key(&other_query, &request)
        );

        let other_opts = SearchRequest {
            threshold: Some(0.5),
            ..SearchRequest::default()
        };
        assert_ne!(
            search_cache_key(&q, &request),
            search_cache_key(&q, &other_opts)
        );
    }

    #[test]
    fn search_cache_key_differs_beyond_first_floats() {
        // queries identical in their first five values must not collide
        let mut a = vec![0.5f32; 16];
        let mut b = vec![0.5f32; 16];
        a[15] = 0.1;
        b[15] = 0.9;
        let request = SearchRequest::default();
        assert_ne!(search_cache_key(&a, &request), search_cache_key(&b, &request));
    }

    #[test]
    fn uninitialized_service_refuses_operations() {
        let service = MemoryService::new(EngramConfig::default());
        assert!(!service.is_ready());
        let err = service.get_rule("r1").unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        let err = service
            .semantic_search(&vec![0.0; 1536], SearchRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }
}
