//! CRUD and scoped listings for refs.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::store::types::{ListOptions, NewRef, RefEntry, RefPatch};
use crate::store::{decode_embedding, decode_metadata, encode_metadata, new_id, now_rfc3339};

const COLUMNS: &str = "id, name, content, embedding, channel_id, metadata, created_at, updated_at";

pub struct RefStore<'a> {
    conn: &'a Connection,
}

impl<'a> RefStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, input: &NewRef) -> Result<RefEntry> {
        let id = new_id(input.id.as_ref());
        let metadata_json = encode_metadata(input.metadata.as_ref())?;
        let now = now_rfc3339();

        self.conn.execute(
            "INSERT INTO refs (id, name, content, channel_id, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, input.name, input.content, input.channel_id, metadata_json, now],
        )?;

        Ok(RefEntry {
            id,
            name: input.name.clone(),
            content: input.content.clone(),
            channel_id: input.channel_id.clone(),
            metadata: input.metadata.clone(),
            embedding: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<RefEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM refs WHERE id = ?1"),
                params![id],
                map_ref,
            )
            .optional()?;
        Ok(entry)
    }

    /// The schema does not enforce name uniqueness; when callers have
    /// written duplicates this returns the most recently updated match.
    pub fn find_by_name(&self, name: &str) -> Result<Option<RefEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM refs WHERE name = ?1 \
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![name],
                map_ref,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn update(&self, id: &str, patch: &RefPatch) -> Result<Option<RefEntry>> {
        let Some(mut entry) = self.find_by_id(id)? else {
            return Ok(None);
        };

        if let Some(name) = &patch.name {
            entry.name = name.clone();
        }
        if let Some(content) = &patch.content {
            entry.content = content.clone();
        }
        if let Some(channel_id) = &patch.channel_id {
            entry.channel_id = Some(channel_id.clone());
        }
        if let Some(metadata) = &patch.metadata {
            entry.metadata = Some(metadata.clone());
        }
        entry.updated_at = now_rfc3339();

        let metadata_json = encode_metadata(entry.metadata.as_ref())?;
        self.conn.execute(
            "UPDATE refs SET name = ?1, content = ?2, channel_id = ?3, metadata = ?4, \
             updated_at = ?5 WHERE id = ?6",
            params![
                entry.name,
                entry.content,
                entry.channel_id,
                metadata_json,
                entry.updated_at,
                id
            ],
        )?;

        Ok(Some(entry))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM refs WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn list(&self, opts: &ListOptions) -> Result<Vec<RefEntry>> {
        let (limit, offset) = opts.page();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM refs ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let entries = stmt
            .query_map(params![limit, offset], map_ref)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM refs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn find_by_channel_id(
        &self,
        channel_id: &str,
        opts: &ListOptions,
    ) -> Result<Vec<RefEntry>> {
        let (limit, offset) = opts.page();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM refs WHERE channel_id = ?1 \
             ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let entries = stmt
            .query_map(params![channel_id, limit, offset], map_ref)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn map_ref(row: &Row<'_>) -> rusqlite::Result<RefEntry> {
    let blob: Option<Vec<u8>> = row.get(3)?;
    let metadata_raw: Option<String> = row.get(5)?;
    Ok(RefEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        content: row.get(2)?,
        embedding: decode_embedding(blob),
        channel_id: row.get(4)?,
        metadata: decode_metadata(metadata_raw),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
