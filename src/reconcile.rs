//! Reconciliation of a conversation against existing memories
//!
//! The reconciler turns a transcript plus a snapshot of the target namespace
//! into a list of [`EditOp`]s. It performs no store I/O: extraction is
//! delegated to the injected [`Extractor`], and everything it proposes is
//! validated and gated here before being handed back. On any failure no edits
//! are returned at all.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::extract::{ExtractionRequest, Extractor};
use crate::memory::{EditOp, MemoryPattern, MemoryRecord};
use crate::message::{render_transcript, Message};
use crate::schema::{MemorySchema, SchemaSet};

/// Options controlling what a reconciliation may produce
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Allowed content shapes (default: free text)
    pub schemas: Vec<MemorySchema>,

    /// Guidance passed through to the extractor
    pub instructions: String,

    /// Whether novel information may create new records
    pub enable_inserts: bool,

    /// Whether superseded records may be removed
    pub enable_deletes: bool,

    /// Cap on live records in the namespace after reconciliation
    pub max_records: Option<usize>,

    pub pattern: MemoryPattern,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            schemas: vec![MemorySchema::text()],
            instructions: String::new(),
            enable_inserts: true,
            enable_deletes: false,
            max_records: None,
            pattern: MemoryPattern::Collection,
        }
    }
}

impl ReconcileConfig {
    /// Single-document profile reconciliation with the given schema
    pub fn profile(schema: MemorySchema) -> Self {
        Self {
            schemas: vec![schema],
            pattern: MemoryPattern::Profile,
            ..Default::default()
        }
    }

    pub fn with_schemas(mut self, schemas: Vec<MemorySchema>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_inserts(mut self, enabled: bool) -> Self {
        self.enable_inserts = enabled;
        self
    }

    pub fn with_deletes(mut self, enabled: bool) -> Self {
        self.enable_deletes = enabled;
        self
    }

    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = Some(max);
        self
    }
}

/// Produces edits for a namespace snapshot by way of an [`Extractor`]
#[derive(Clone)]
pub struct Reconciler {
    extractor: Arc<dyn Extractor>,
}

impl Reconciler {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }

    /// Reconcile `conversation` against `existing`.
    ///
    /// Output is only as deterministic as the extractor; identical inputs may
    /// yield differently phrased content.
    pub async fn reconcile(
        &self,
        conversation: &[Message],
        existing: &[MemoryRecord],
        config: &ReconcileConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<EditOp>> {
        let schemas = SchemaSet::compile(&config.schemas)?;

        let transcript = render_transcript(conversation);
        if transcript.trim().is_empty() {
            debug!("Empty conversation, nothing to reconcile");
            return Ok(Vec::new());
        }

        if cancel.is_cancelled() {
            return Err(Error::cancelled("reconciliation cancelled before extraction"));
        }

        // A profile namespace holds at most one live document; if several slipped
        // in externally, the most recently updated one is the profile.
        let visible: Vec<MemoryRecord> = match config.pattern {
            MemoryPattern::Profile => existing
                .iter()
                .max_by_key(|r| r.updated_at)
                .cloned()
                .into_iter()
                .collect(),
            MemoryPattern::Collection => existing.to_vec(),
        };

        let request = ExtractionRequest {
            transcript,
            schemas: config.schemas.clone(),
            instructions: config.instructions.clone(),
            existing: visible.clone(),
            pattern: config.pattern,
            enable_inserts: config.enable_inserts,
            enable_deletes: config.enable_deletes,
        };

        let proposed = self
            .extractor
            .extract(request, cancel.clone())
            .await
            .map_err(|e| match e {
                Error::Extraction(_) | Error::Cancelled(_) => e,
                other => Error::extraction(other.to_string()),
            })?;

        if cancel.is_cancelled() {
            return Err(Error::cancelled("reconciliation cancelled during extraction"));
        }

        validate_proposals(&proposed, &visible, &schemas)?;

        match config.pattern {
            MemoryPattern::Profile => shape_profile(proposed, visible.first(), config, &schemas),
            MemoryPattern::Collection => Ok(shape_collection(proposed, visible.len(), config)),
        }
    }
}

/// Every proposed edit must follow a configured schema and target a snapshot record
fn validate_proposals(
    proposed: &[EditOp],
    snapshot: &[MemoryRecord],
    schemas: &SchemaSet,
) -> Result<()> {
    let known: HashSet<Uuid> = snapshot.iter().map(|r| r.id).collect();

    for op in proposed {
        if let Some(id) = op.target() {
            if !known.contains(&id) {
                return Err(Error::extraction(format!(
                    "edit references memory {} which is not in the snapshot",
                    id
                )));
            }
        }
        match op {
            EditOp::Insert { kind, content } | EditOp::Update { kind, content, .. } => {
                schemas.validate(kind, content)?;
            }
            EditOp::Remove { .. } => {}
        }
    }

    Ok(())
}

fn shape_profile(
    proposed: Vec<EditOp>,
    current: Option<&MemoryRecord>,
    config: &ReconcileConfig,
    schemas: &SchemaSet,
) -> Result<Vec<EditOp>> {
    let mut kind = None;
    let mut document: Option<Value> = None;
    let mut dropped_removes = 0;

    for op in proposed {
        match op {
            EditOp::Insert { kind: k, content } | EditOp::Update { kind: k, content, .. } => {
                document = Some(match document {
                    Some(acc) => merge_document(&acc, &content),
                    None => content,
                });
                kind = Some(k);
            }
            EditOp::Remove { .. } => dropped_removes += 1,
        }
    }

    if dropped_removes > 0 {
        debug!(dropped_removes, "Ignoring removes proposed for a profile document");
    }

    let (Some(kind), Some(document)) = (kind, document) else {
        return Ok(Vec::new());
    };

    match current {
        Some(record) => {
            let merged = merge_document(&record.content, &document);
            schemas.validate(&kind, &merged)?;
            Ok(vec![EditOp::update(record.id, kind, merged)])
        }
        None if config.enable_inserts => {
            // proposals merged across kinds must still fit the kind they end up under
            schemas.validate(&kind, &document)?;
            Ok(vec![EditOp::insert(kind, document)])
        }
        None => {
            info!("Inserts disabled, dropping new profile document");
            Ok(Vec::new())
        }
    }
}

/// Field-wise merge where `newer` wins; non-object content is replaced wholesale
fn merge_document(older: &Value, newer: &Value) -> Value {
    match (older, newer) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (field, value) in new {
                merged.insert(field.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => newer.clone(),
    }
}

fn shape_collection(proposed: Vec<EditOp>, existing: usize, config: &ReconcileConfig) -> Vec<EditOp> {
    let mut edits = Vec::with_capacity(proposed.len());
    let mut dropped_inserts = 0usize;
    let mut dropped_removes = 0usize;
    let mut removed = HashSet::new();

    for op in proposed {
        match op {
            EditOp::Insert { .. } if !config.enable_inserts => dropped_inserts += 1,
            EditOp::Remove { .. } if !config.enable_deletes => dropped_removes += 1,
            EditOp::Remove { id } => {
                removed.insert(id);
                edits.push(op);
            }
            other => edits.push(other),
        }
    }

    if dropped_inserts > 0 {
        info!(dropped_inserts, "Inserts disabled, dropping novel memories");
    }
    if dropped_removes > 0 {
        debug!(dropped_removes, "Deletes disabled, dropping proposed removals");
    }

    if let Some(max) = config.max_records {
        let mut room = max.saturating_sub(existing.saturating_sub(removed.len()));
        let mut capped = 0usize;
        edits.retain(|op| match op {
            EditOp::Insert { .. } if room == 0 => {
                capped += 1;
                false
            }
            EditOp::Insert { .. } => {
                room -= 1;
                true
            }
            _ => true,
        });
        if capped > 0 {
            info!(capped, max, "Record cap reached, dropping extra inserts");
        }
    }

    edits
}
