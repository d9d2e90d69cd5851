//! CRUD and scoped listings for project documents.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::store::types::{ListOptions, NewProjectDoc, ProjectDoc, ProjectDocPatch};
use crate::store::{
    decode_embedding, decode_metadata, decode_tags, encode_metadata, encode_tags, new_id,
    now_rfc3339,
};

const COLUMNS: &str =
    "id, project_id, title, content, file_path, embedding, tags, metadata, created_at, updated_at";

pub struct DocStore<'a> {
    conn: &'a Connection,
}

impl<'a> DocStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn create(&self, input: &NewProjectDoc) -> Result<ProjectDoc> {
        let id = new_id(input.id.as_ref());
        let tags_json = encode_tags(&input.tags)?;
        let metadata_json = encode_metadata(input.metadata.as_ref())?;
        let now = now_rfc3339();

        self.conn.execute(
            "INSERT INTO project_docs \
             (id, project_id, title, content, file_path, tags, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                input.project_id,
                input.title,
                input.content,
                input.file_path,
                tags_json,
                metadata_json,
                now
            ],
        )?;

        Ok(ProjectDoc {
            id,
            project_id: input.project_id.clone(),
            title: input.title.clone(),
            content: input.content.clone(),
            file_path: input.file_path.clone(),
            tags: input.tags.clone(),
            metadata: input.metadata.clone(),
            embedding: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<ProjectDoc>> {
        let doc = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM project_docs WHERE id = ?1"),
                params![id],
                map_doc,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn update(&self, id: &str, patch: &ProjectDocPatch) -> Result<Option<ProjectDoc>> {
        let Some(mut doc) = self.find_by_id(id)? else {
            return Ok(None);
        };

        if let Some(project_id) = &patch.project_id {
            doc.project_id = project_id.clone();
        }
        if let Some(title) = &patch.title {
            doc.title = title.clone();
        }
        if let Some(content) = &patch.content {
            doc.content = content.clone();
        }
        if let Some(file_path) = &patch.file_path {
            doc.file_path = Some(file_path.clone());
        }
        if let Some(tags) = &patch.tags {
            doc.tags = tags.clone();
        }
        if let Some(metadata) = &patch.metadata {
            doc.metadata = Some(metadata.clone());
        }
        doc.updated_at = now_rfc3339();

        let tags_json = encode_tags(&doc.tags)?;
        let metadata_json = encode_metadata(doc.metadata.as_ref())?;
        self.conn.execute(
            "UPDATE project_docs SET project_id = ?1, title = ?2, content = ?3, file_path = ?4, \
             tags = ?5, metadata = ?6, updated_at = ?7 WHERE id = ?8",
            params![
                doc.project_id,
                doc.title,
                doc.content,
                doc.file_path,
                tags_json,
                metadata_json,
                doc.updated_at,
                id
            ],
        )?;

        Ok(Some(doc))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM project_docs WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn list(&self, opts: &ListOptions) -> Result<Vec<ProjectDoc>> {
        let (limit, offset) = opts.page();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM project_docs ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2"
        ))?;
        let docs = stmt
            .query_map(params![limit, offset], map_doc)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM project_docs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn find_by_project_id(
        &self,
        project_id: &str,
        opts: &ListOptions,
    ) -> Result<Vec<ProjectDoc>> {
        let (limit, offset) = opts.page();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM project_docs WHERE project_id = ?1 \
             ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let docs = stmt
            .query_map(params![project_id, limit, offset], map_doc)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(docs)
    }
}

fn map_doc(row: &Row<'_>) -> rusqlite::Result<ProjectDoc> {
    let blob: Option<Vec<u8>> = row.get(5)?;
    let tags_raw: String = row.get(6)?;
    let metadata_raw: Option<String> = row.get(7)?;
    Ok(ProjectDoc {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        file_path: row.get(4)?,
        embedding: decode_embedding(blob),
        tags: decode_tags(&tags_raw),
        metadata: decode_metadata(metadata_raw),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
