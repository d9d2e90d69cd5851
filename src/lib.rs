//! Embedded memory store for AI agent runtimes.
//!
//! Engram persists three kinds of textual artifacts, each optionally
//! annotated with a dense embedding vector: **rules** (tiered policy
//! statements), **project docs** (grouped by project), and **refs**
//! (named lookups, optionally channel-scoped). Clients write artifacts, fetch them by
//! identity, list them by scoped attributes, and run semantic similarity
//! search across the whole corpus with a query embedding.
//!
//! # Architecture
//!
//! - **Storage**: SQLite in WAL mode behind a bounded [`db::pool`] with
//!   FIFO waiter queueing, health-checked reuse, and an idle reaper
//! - **Vectors**: caller-supplied float32 embeddings stored as packed
//!   little-endian BLOBs on each row; search is an exact cosine scan with
//!   thresholded top-K ranking ([`vector`])
//! - **Caching**: a write-through LRU+TTL [`cache`] fronting identity
//!   reads and search results
//! - **Schema**: versioned, transactional [`db::migrations`]
//!
//! The [`service::MemoryService`] facade composes these behind one
//! operational API. It does not compute embeddings; bring your own model.
//!
//! # Modules
//!
//! - [`config`] — Configuration from TOML files and environment variables
//! - [`db`] — Connections, pooling, schema, and migrations
//! - [`cache`] — Bounded LRU+TTL cache with hit accounting
//! - [`vector`] — Float32 codec, similarity metrics, and the vector index
//! - [`store`] — Per-kind row storage (rules, project docs, refs)
//! - [`service`] — The memory service facade

pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod service;
pub mod store;
pub mod vector;

pub use error::{Error, Result};
pub use service::MemoryService;
