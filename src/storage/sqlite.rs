//! SQLite storage for memory records

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::{apply_edits_on, matches_query, MemoryStore};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::{ApplyReport, EditOp, MemoryRecord};
use crate::namespace::{Namespace, SEPARATOR};

const SELECT_COLUMNS: &str =
    "SELECT namespace, id, kind, content, created_at, updated_at FROM memories";

/// SQLite storage backend
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `config.sqlite_path()`
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        let path = config.sqlite_path();
        info!("Opening memory database at {:?}", path);
        Self::from_connection(Connection::open(path)?)
    }

    /// A private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Initialize schema
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::store(e.to_string()))
    }
}

fn get_record(conn: &Connection, namespace: &Namespace, id: Uuid) -> Result<Option<MemoryRecord>> {
    let sql = format!("{} WHERE namespace = ?1 AND id = ?2", SELECT_COLUMNS);
    let row = conn
        .query_row(
            &sql,
            params![namespace.to_string(), id.to_string()],
            MemoryRow::from_row,
        )
        .optional()?;

    row.map(MemoryRow::into_record).transpose()
}

fn put_record(
    conn: &Connection,
    namespace: &Namespace,
    id: Uuid,
    kind: &str,
    content: &Value,
) -> Result<MemoryRecord> {
    let now = timestamp_now();
    conn.execute(
        r#"
        INSERT INTO memories (namespace, id, kind, content, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        ON CONFLICT(namespace, id) DO UPDATE SET
            kind = excluded.kind,
            content = excluded.content,
            updated_at = excluded.updated_at
        "#,
        params![
            namespace.to_string(),
            id.to_string(),
            kind,
            serde_json::to_string(content)?,
            now,
        ],
    )?;

    get_record(conn, namespace, id)?
        .ok_or_else(|| Error::store(format!("memory {} vanished after write", id)))
}

fn update_record(
    conn: &Connection,
    namespace: &Namespace,
    id: Uuid,
    kind: &str,
    content: &Value,
) -> Result<Option<MemoryRecord>> {
    let changed = conn.execute(
        "UPDATE memories SET kind = ?1, content = ?2, updated_at = ?3 WHERE namespace = ?4 AND id = ?5",
        params![
            kind,
            serde_json::to_string(content)?,
            timestamp_now(),
            namespace.to_string(),
            id.to_string(),
        ],
    )?;

    if changed == 0 {
        return Ok(None);
    }
    get_record(conn, namespace, id)
}

fn delete_record(conn: &Connection, namespace: &Namespace, id: Uuid) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM memories WHERE namespace = ?1 AND id = ?2",
        params![namespace.to_string(), id.to_string()],
    )?;
    Ok(deleted > 0)
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn snapshot(&self, namespace: &Namespace) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock()?;

        let sql = format!("{} WHERE namespace = ?1 ORDER BY created_at, id", SELECT_COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![namespace.to_string()], MemoryRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }

        Ok(records)
    }

    async fn get(&self, namespace: &Namespace, id: Uuid) -> Result<Option<MemoryRecord>> {
        let conn = self.lock()?;
        get_record(&conn, namespace, id)
    }

    async fn put(
        &self,
        namespace: &Namespace,
        id: Uuid,
        kind: &str,
        content: Value,
    ) -> Result<MemoryRecord> {
        let conn = self.lock()?;
        put_record(&conn, namespace, id, kind, &content)
    }

    async fn update(
        &self,
        namespace: &Namespace,
        id: Uuid,
        kind: &str,
        content: Value,
    ) -> Result<Option<MemoryRecord>> {
        let conn = self.lock()?;
        update_record(&conn, namespace, id, kind, &content)
    }

    async fn delete(&self, namespace: &Namespace, id: Uuid) -> Result<bool> {
        let conn = self.lock()?;
        delete_record(&conn, namespace, id)
    }

    async fn search(
        &self,
        prefix: &Namespace,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.lock()?;

        let mut sql = format!("{} WHERE 1=1", SELECT_COLUMNS);
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let exact = prefix.to_string();
        if !exact.is_empty() {
            // exact namespace or a descendant; substr avoids LIKE wildcards in segments
            sql.push_str(" AND (namespace = ? OR substr(namespace, 1, length(?)) = ?)");
            let nested = format!("{}{}", exact, SEPARATOR);
            params_vec.push(Box::new(exact));
            params_vec.push(Box::new(nested.clone()));
            params_vec.push(Box::new(nested));
        }

        sql.push_str(" ORDER BY updated_at DESC, id");

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

        let mut rows = Vec::new();
        for row in stmt.query_map(params_refs.as_slice(), MemoryRow::from_row)? {
            rows.push(row?);
        }

        let query_lower = query.to_lowercase();
        let mut hits = Vec::new();
        for row in rows {
            let record = row.into_record()?;
            if matches_query(&record, &query_lower) {
                hits.push(record);
            }
        }

        Ok(hits.into_iter().skip(offset).take(limit).collect())
    }

    /// Applies the whole batch in one transaction; a failing edit rolls back the rest
    async fn apply(&self, namespace: &Namespace, edits: &[EditOp]) -> Result<ApplyReport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let report = apply_edits_on(
            namespace,
            edits,
            |kind, content| put_record(&tx, namespace, Uuid::new_v4(), kind, content).map(|r| r.id),
            |id, kind, content| update_record(&tx, namespace, id, kind, content).map(|r| r.is_some()),
            |id| delete_record(&tx, namespace, id),
        )?;

        tx.commit()?;
        Ok(report)
    }
}

/// Intermediate struct for reading from SQLite
struct MemoryRow {
    namespace: String,
    id: String,
    kind: String,
    content: String,
    created_at: String,
    updated_at: String,
}

impl MemoryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            namespace: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            content: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<MemoryRecord> {
        Ok(MemoryRecord {
            id: Uuid::parse_str(&self.id).map_err(|e| Error::store(e.to_string()))?,
            namespace: Namespace::parse(&self.namespace)?,
            kind: self.kind,
            content: serde_json::from_str(&self.content)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering
fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::store(e.to_string()))
}
