//! Job bookkeeping types shared between the scheduler and its callers

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Error;
use crate::memory::ApplyReport;
use crate::message::Message;
use crate::namespace::NamespaceTemplate;
use crate::reconcile::ReconcileConfig;

/// Identifier handed out per submission, unique within one scheduler
pub type JobId = u64;

/// Lifecycle of a reflection job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How a job ended
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Edits were applied (possibly none)
    Completed(ApplyReport),

    /// Superseded or shut down; nothing from this job reached the store
    Cancelled,

    Failed(Arc<Error>),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }

    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            JobOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            JobOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Value published on a job's watch channel
#[derive(Debug, Clone)]
pub(crate) enum JobState {
    Pending,
    Running,
    Done(JobOutcome),
}

impl JobState {
    pub(crate) fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Running => JobStatus::Running,
            JobState::Done(outcome) => outcome.status(),
        }
    }
}

/// Broadcast on every status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub key: String,
    pub status: JobStatus,
    pub error: Option<String>,
}

/// The payload of a reflection: what to reconcile and where
#[derive(Debug, Clone)]
pub struct ReflectionRequest {
    /// Target namespace, possibly with `{placeholders}`
    pub namespace: NamespaceTemplate,

    pub conversation: Vec<Message>,

    /// Values for the namespace placeholders
    pub bindings: HashMap<String, String>,

    /// Overrides the scheduler's reconcile defaults
    pub config: Option<ReconcileConfig>,
}

impl ReflectionRequest {
    pub fn new(namespace: impl Into<NamespaceTemplate>, conversation: Vec<Message>) -> Self {
        Self {
            namespace: namespace.into(),
            conversation,
            bindings: HashMap::new(),
            config: None,
        }
    }

    pub fn with_binding(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.bindings.insert(name.into(), value.into());
        self
    }

    pub fn with_config(mut self, config: ReconcileConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// Caller-side view of a submitted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    key: String,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, key: String, state: watch::Receiver<JobState>) -> Self {
        Self { id, key, state }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current status, without waiting
    pub fn status(&self) -> JobStatus {
        self.state.borrow().status()
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(|s| s.status().is_terminal()).await {
            if let JobState::Done(outcome) = &*state {
                return outcome.clone();
            }
        }
        // the task went away without reporting; nothing of it was applied
        JobOutcome::Cancelled
    }
}
