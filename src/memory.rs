//! Memory records and the edit operations that reconcile them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::namespace::Namespace;

/// How memories are organised within a namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPattern {
    /// A single continuously merged document per namespace
    Profile,

    /// An open-ended set of discrete records per namespace
    #[default]
    Collection,
}

impl std::fmt::Display for MemoryPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryPattern::Profile => write!(f, "profile"),
            MemoryPattern::Collection => write!(f, "collection"),
        }
    }
}

/// An identified unit of stored knowledge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Assigned at first insert and preserved across updates
    pub id: Uuid,

    /// Namespace the record lives in
    pub namespace: Namespace,

    /// Name of the schema the content follows
    pub kind: String,

    /// Schema-conforming payload
    pub content: Value,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Create a new record stamped with the current time
    pub fn new(namespace: Namespace, id: Uuid, kind: impl Into<String>, content: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            namespace,
            kind: kind.into(),
            content,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite kind and content, refreshing `updated_at` while keeping `id` and `created_at`
    pub fn revise(&mut self, kind: impl Into<String>, content: Value) {
        self.kind = kind.into();
        self.content = content;
        self.updated_at = Utc::now().max(self.created_at);
    }
}

/// A single edit produced by reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum EditOp {
    Insert { kind: String, content: Value },
    Update { id: Uuid, kind: String, content: Value },
    Remove { id: Uuid },
}

impl EditOp {
    pub fn insert(kind: impl Into<String>, content: Value) -> Self {
        Self::Insert {
            kind: kind.into(),
            content,
        }
    }

    pub fn update(id: Uuid, kind: impl Into<String>, content: Value) -> Self {
        Self::Update {
            id,
            kind: kind.into(),
            content,
        }
    }

    pub fn remove(id: Uuid) -> Self {
        Self::Remove { id }
    }

    /// The existing record this edit targets, if any
    pub fn target(&self) -> Option<Uuid> {
        match self {
            EditOp::Insert { .. } => None,
            EditOp::Update { id, .. } | EditOp::Remove { id } => Some(*id),
        }
    }
}

/// What happened when a job's edits were applied to a store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Ids generated for inserted records
    pub inserted: Vec<Uuid>,

    pub updated: Vec<Uuid>,

    pub removed: Vec<Uuid>,

    /// Updates whose record vanished after the snapshot was taken
    pub missing_updates: Vec<Uuid>,

    /// Removes whose record was already gone
    pub missing_removes: Vec<Uuid>,
}

impl ApplyReport {
    /// Number of edits that changed the store
    pub fn applied(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.removed.len()
    }

    /// Whether every edit degraded to a no-op (or there were none)
    pub fn is_noop(&self) -> bool {
        self.applied() == 0
    }
}
