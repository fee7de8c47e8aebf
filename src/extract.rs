//! The extraction collaborator: an LLM (or anything else) that proposes memory edits
//!
//! recollect never talks to a model provider itself. Hosts implement
//! [`Extractor`] over whatever client they use and inject it into the
//! [`Reconciler`](crate::reconcile::Reconciler).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::memory::{EditOp, MemoryPattern, MemoryRecord};
use crate::schema::MemorySchema;

/// Everything the extractor needs to propose edits for one reconciliation
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    /// Rendered conversation transcript
    pub transcript: String,

    /// Shapes the proposed content must follow
    pub schemas: Vec<MemorySchema>,

    /// Free-text guidance from the caller
    pub instructions: String,

    /// Records currently visible in the target namespace
    pub existing: Vec<MemoryRecord>,

    pub pattern: MemoryPattern,

    pub enable_inserts: bool,

    pub enable_deletes: bool,
}

/// Proposes edits for a conversation against an existing snapshot.
///
/// Implementations should return an error (mapped to an extraction error)
/// when the model fails; the reconciler validates whatever comes back.
/// The token is cancelled when the job is superseded; checking it is optional,
/// the result is discarded either way.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        request: ExtractionRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<EditOp>>;
}

/// Adapter turning a plain closure into an [`Extractor`]
pub struct FnExtractor<F> {
    f: F,
}

impl<F> FnExtractor<F>
where
    F: Fn(&ExtractionRequest) -> Result<Vec<EditOp>> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Extractor for FnExtractor<F>
where
    F: Fn(&ExtractionRequest) -> Result<Vec<EditOp>> + Send + Sync,
{
    async fn extract(
        &self,
        request: ExtractionRequest,
        _cancel: CancellationToken,
    ) -> Result<Vec<EditOp>> {
        (self.f)(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_extractor_sees_request() {
        let extractor = FnExtractor::new(|req: &ExtractionRequest| {
            Ok(vec![EditOp::insert("Memory", json!(req.transcript.trim()))])
        });

        let request = ExtractionRequest {
            transcript: "user: hello\n".to_string(),
            schemas: vec![MemorySchema::text()],
            instructions: String::new(),
            existing: Vec::new(),
            pattern: MemoryPattern::Collection,
            enable_inserts: true,
            enable_deletes: false,
        };

        let edits = extractor
            .extract(request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(edits, vec![EditOp::insert("Memory", json!("user: hello"))]);
    }
}
