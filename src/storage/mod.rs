//! Storage backends for recollect
//!
//! The store is an external shared resource; the scheduler only relies on the
//! atomicity of single `put`/`update`/`delete` calls plus the namespace lock
//! it holds while applying a job's edits.

mod in_memory;
mod sqlite;

pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::memory::{ApplyReport, EditOp, MemoryRecord};
use crate::namespace::Namespace;

/// Default page size for [`MemoryStore::search`] callers that do not choose one
pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// A namespaced record store
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// All records currently in `namespace`, oldest first
    async fn snapshot(&self, namespace: &Namespace) -> Result<Vec<MemoryRecord>>;

    async fn get(&self, namespace: &Namespace, id: Uuid) -> Result<Option<MemoryRecord>>;

    /// Create or overwrite a record, preserving `created_at` when it already exists
    async fn put(
        &self,
        namespace: &Namespace,
        id: Uuid,
        kind: &str,
        content: Value,
    ) -> Result<MemoryRecord>;

    /// Overwrite an existing record; `None` if it no longer exists
    async fn update(
        &self,
        namespace: &Namespace,
        id: Uuid,
        kind: &str,
        content: Value,
    ) -> Result<Option<MemoryRecord>>;

    /// Delete a record, returning whether it existed
    async fn delete(&self, namespace: &Namespace, id: Uuid) -> Result<bool>;

    /// Case-insensitive substring search over records under `prefix`, newest first
    async fn search(
        &self,
        prefix: &Namespace,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>>;

    /// Apply a job's edits in order.
    ///
    /// Backends that support transactions should override this so the batch
    /// is all-or-nothing; the default applies edits one by one and may leave
    /// a prefix applied if a later edit fails.
    async fn apply(&self, namespace: &Namespace, edits: &[EditOp]) -> Result<ApplyReport> {
        apply_edits(self, namespace, edits).await
    }
}

/// Apply `edits` to `store` one at a time, in order.
///
/// Inserts get a fresh id. Updates and removes of records that vanished since
/// the snapshot are reported in the [`ApplyReport`] rather than failing.
pub async fn apply_edits<S>(store: &S, namespace: &Namespace, edits: &[EditOp]) -> Result<ApplyReport>
where
    S: MemoryStore + ?Sized,
{
    let mut report = ApplyReport::default();

    for edit in edits {
        match edit {
            EditOp::Insert { kind, content } => {
                let record = store
                    .put(namespace, Uuid::new_v4(), kind, content.clone())
                    .await?;
                report.inserted.push(record.id);
            }
            EditOp::Update { id, kind, content } => {
                let found = store.update(namespace, *id, kind, content.clone()).await?.is_some();
                note_update(&mut report, namespace, *id, found);
            }
            EditOp::Remove { id } => {
                let found = store.delete(namespace, *id).await?;
                note_remove(&mut report, namespace, *id, found);
            }
        }
    }

    Ok(report)
}

/// Synchronous counterpart of [`apply_edits`] for backends that run the batch
/// inside their own transaction.
pub(crate) fn apply_edits_on<I, U, R>(
    namespace: &Namespace,
    edits: &[EditOp],
    mut insert: I,
    mut update: U,
    mut remove: R,
) -> Result<ApplyReport>
where
    I: FnMut(&str, &Value) -> Result<Uuid>,
    U: FnMut(Uuid, &str, &Value) -> Result<bool>,
    R: FnMut(Uuid) -> Result<bool>,
{
    let mut report = ApplyReport::default();

    for edit in edits {
        match edit {
            EditOp::Insert { kind, content } => report.inserted.push(insert(kind, content)?),
            EditOp::Update { id, kind, content } => {
                let found = update(*id, kind, content)?;
                note_update(&mut report, namespace, *id, found);
            }
            EditOp::Remove { id } => {
                let found = remove(*id)?;
                note_remove(&mut report, namespace, *id, found);
            }
        }
    }

    Ok(report)
}

fn note_update(report: &mut ApplyReport, namespace: &Namespace, id: Uuid, found: bool) {
    if found {
        report.updated.push(id);
    } else {
        warn!(%namespace, %id, "Update target was deleted concurrently, skipping");
        report.missing_updates.push(id);
    }
}

fn note_remove(report: &mut ApplyReport, namespace: &Namespace, id: Uuid, found: bool) {
    if found {
        report.removed.push(id);
    } else {
        debug!(%namespace, %id, "Remove target already absent");
        report.missing_removes.push(id);
    }
}

/// Whether a record matches a search query (empty query matches everything)
pub(crate) fn matches_query(record: &MemoryRecord, query_lower: &str) -> bool {
    if query_lower.is_empty() {
        return true;
    }
    let text = match &record.content {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    text.contains(query_lower) || record.kind.to_lowercase().contains(query_lower)
}
