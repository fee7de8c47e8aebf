//! # Recollect
//!
//! Long-term memory maintenance for LLM agents.
//!
//! ## Architecture
//!
//! - **Reconciler** - turns a conversation plus the memories already stored in
//!   a namespace into a list of insert/update/remove edits, via a pluggable
//!   [`Extractor`] (usually an LLM call) and JSON-schema validation
//! - **Reflection scheduler** - debounces reconciliation per conversation key,
//!   cancels superseded work and serializes writes per namespace
//! - **Stores** - in-memory and SQLite backends behind [`MemoryStore`]
//! - **Tools** - `manage_memory` / `search_memory` for agents to call directly
//!
//! ## Usage
//!
//! ```rust,ignore
//! use recollect::{Config, ReflectionRequest, ReflectionScheduler, Reconciler, SqliteStore};
//!
//! let config = Config::default();
//! let store = Arc::new(SqliteStore::new(&config)?);
//! let scheduler = ReflectionScheduler::new(Reconciler::new(extractor), store, config)?;
//!
//! // Re-arm the reflection every time the thread gets a new message
//! let request = ReflectionRequest::new(["memories", "{user_id}"], conversation)
//!     .with_binding("user_id", user_id);
//! let handle = scheduler.submit(thread_id, request, Duration::from_secs(30))?;
//!
//! // Later
//! scheduler.shutdown(true).await;
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod logging;
pub mod memory;
pub mod message;
pub mod namespace;
pub mod reconcile;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod tools;

pub use config::Config;
pub use error::{Error, Result};
pub use extract::{ExtractionRequest, Extractor, FnExtractor};
pub use memory::{ApplyReport, EditOp, MemoryPattern, MemoryRecord};
pub use message::{Message, Role};
pub use namespace::{Namespace, NamespaceTemplate};
pub use reconcile::{ReconcileConfig, Reconciler};
pub use scheduler::{JobEvent, JobHandle, JobId, JobOutcome, JobStatus, ReflectionRequest, ReflectionScheduler};
pub use schema::{MemorySchema, SchemaSet};
pub use storage::{InMemoryStore, MemoryStore, SqliteStore};
pub use tools::{ManageMemoryTool, SearchMemoryTool};
