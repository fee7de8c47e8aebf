//! Memory tools an agent can call directly from its own turn
//!
//! Both tools are bound to a store and a namespace template; placeholders are
//! filled from per-call bindings, so one tool instance can serve many users.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::MemoryRecord;
use crate::namespace::NamespaceTemplate;
use crate::schema::TEXT_KIND;
use crate::storage::{MemoryStore, DEFAULT_SEARCH_LIMIT};

const MANAGE_INSTRUCTIONS: &str = "Proactively call this tool when you:
1. Identify a new USER preference.
2. Receive an explicit USER request to remember something or otherwise alter your behavior.
3. Are working and want to record important context.
4. Identify that an existing MEMORY is incorrect or outdated.";

fn default_template() -> NamespaceTemplate {
    NamespaceTemplate::new(["memories", "{user_id}"])
}

/// What `manage_memory` should do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Create,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
struct ManageArgs {
    content: Option<String>,
    #[serde(default)]
    action: Action,
    id: Option<Uuid>,
}

/// Create, update or delete a single free-text memory
#[derive(Clone)]
pub struct ManageMemoryTool {
    store: Arc<dyn MemoryStore>,
    namespace: NamespaceTemplate,
    instructions: String,
}

impl ManageMemoryTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            namespace: default_template(),
            instructions: MANAGE_INSTRUCTIONS.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<NamespaceTemplate>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn name(&self) -> &'static str {
        "manage_memory"
    }

    pub fn description(&self) -> String {
        format!(
            "Create, update, or delete persistent MEMORIES that will be carried over to future conversations.\n{}",
            self.instructions
        )
    }

    pub fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string" },
                "action": { "type": "string", "enum": ["create", "update", "delete"], "default": "create" },
                "id": { "type": "string", "format": "uuid" }
            }
        })
    }

    /// Run one call, returning the message handed back to the model
    pub async fn invoke(&self, args: Value, bindings: &HashMap<String, String>) -> Result<String> {
        let args: ManageArgs = serde_json::from_value(args)
            .map_err(|e| Error::invalid_input(format!("malformed manage_memory arguments: {}", e)))?;

        let id = match (args.action, args.id) {
            (Action::Create, Some(_)) => {
                return Err(Error::invalid_input(
                    "cannot provide a memory id when creating a memory; omit the id and try again",
                ))
            }
            (Action::Update | Action::Delete, None) => {
                return Err(Error::invalid_input(
                    "a memory id is required when updating or deleting a memory",
                ))
            }
            (Action::Create, None) => Uuid::new_v4(),
            (_, Some(id)) => id,
        };

        let namespace = self.namespace.resolve(bindings)?;

        if args.action == Action::Delete {
            let existed = self.store.delete(&namespace, id).await?;
            debug!(%namespace, %id, existed, "Memory deleted by tool");
            return Ok(format!("Deleted memory {}", id));
        }

        let content = args
            .content
            .ok_or_else(|| Error::invalid_input("content is required to create or update a memory"))?;

        // plain text under the free-text kind, so reconciliation sees these as its own memories;
        // update of an unknown id stores it, matching create-or-overwrite semantics
        self.store
            .put(&namespace, id, TEXT_KIND, Value::String(content))
            .await?;

        let verb = match args.action {
            Action::Create => "created",
            _ => "updated",
        };
        debug!(%namespace, %id, verb, "Memory written by tool");
        Ok(format!("{} memory {}", verb, id))
    }
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    #[serde(default)]
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    /// Exact-match constraints on fields of structured content
    #[serde(default)]
    filter: Option<Map<String, Value>>,
}

fn matches_filter(record: &MemoryRecord, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| record.content.get(field) == Some(expected))
}

fn default_limit() -> usize {
    DEFAULT_SEARCH_LIMIT
}

/// Look up memories under the bound namespace
#[derive(Clone)]
pub struct SearchMemoryTool {
    store: Arc<dyn MemoryStore>,
    namespace: NamespaceTemplate,
    instructions: String,
}

impl SearchMemoryTool {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            namespace: default_template(),
            instructions: String::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<NamespaceTemplate>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn name(&self) -> &'static str {
        "search_memory"
    }

    pub fn description(&self) -> String {
        format!(
            "Search your long-term memories for information relevant to your current context. {}",
            self.instructions
        )
        .trim_end()
        .to_string()
    }

    pub fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer", "minimum": 1, "default": DEFAULT_SEARCH_LIMIT },
                "offset": { "type": "integer", "minimum": 0, "default": 0 },
                "filter": { "type": "object" }
            },
            "required": ["query"]
        })
    }

    pub async fn invoke(&self, args: Value, bindings: &HashMap<String, String>) -> Result<Vec<MemoryRecord>> {
        let args: SearchArgs = serde_json::from_value(args)
            .map_err(|e| Error::invalid_input(format!("malformed search_memory arguments: {}", e)))?;
        let namespace = self.namespace.resolve(bindings)?;

        let records = match &args.filter {
            None => {
                self.store
                    .search(&namespace, &args.query, args.limit, args.offset)
                    .await?
            }
            // page after filtering so limit/offset count matching records only
            Some(filter) => self
                .store
                .search(&namespace, &args.query, usize::MAX, 0)
                .await?
                .into_iter()
                .filter(|record| matches_filter(record, filter))
                .skip(args.offset)
                .take(args.limit)
                .collect(),
        };
        debug!(%namespace, query = %args.query, hits = records.len(), "Memory search");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::schema::{MemorySchema, SchemaSet};
    use crate::storage::InMemoryStore;

    fn user(id: &str) -> HashMap<String, String> {
        HashMap::from([("user_id".to_string(), id.to_string())])
    }

    fn id_of(message: &str) -> Uuid {
        message.rsplit(' ').next().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let store = Arc::new(InMemoryStore::new());
        let tool = ManageMemoryTool::new(store.clone());
        let ns = Namespace::new(["memories", "u-1"]).unwrap();

        let created = tool
            .invoke(json!({"content": "prefers dark mode"}), &user("u-1"))
            .await
            .unwrap();
        assert!(created.starts_with("created memory "));
        let id = id_of(&created);

        let record = store.get(&ns, id).await.unwrap().unwrap();
        assert_eq!(record.kind, TEXT_KIND);
        assert_eq!(record.content, json!("prefers dark mode"));
        SchemaSet::compile(&[MemorySchema::text()])
            .unwrap()
            .validate(&record.kind, &record.content)
            .unwrap();

        let updated = tool
            .invoke(
                json!({"action": "update", "id": id, "content": "prefers light mode"}),
                &user("u-1"),
            )
            .await
            .unwrap();
        assert_eq!(updated, format!("updated memory {}", id));
        let record = store.get(&ns, id).await.unwrap().unwrap();
        assert_eq!(record.content, json!("prefers light mode"));

        let deleted = tool
            .invoke(json!({"action": "delete", "id": id}), &user("u-1"))
            .await
            .unwrap();
        assert_eq!(deleted, format!("Deleted memory {}", id));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let tool = ManageMemoryTool::new(Arc::new(InMemoryStore::new()));
        let bindings = user("u-1");

        let err = tool
            .invoke(json!({"content": "x", "id": Uuid::new_v4()}), &bindings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = tool.invoke(json!({"action": "delete"}), &bindings).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = tool
            .invoke(json!({"action": "update", "content": "x"}), &bindings)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = tool.invoke(json!({}), &bindings).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = tool.invoke(json!({"action": "forget"}), &bindings).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_binding_is_config_error() {
        let tool = ManageMemoryTool::new(Arc::new(InMemoryStore::new()));
        let err = tool
            .invoke(json!({"content": "x"}), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_search_is_scoped_to_bound_user() {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let manage = ManageMemoryTool::new(store.clone());
        let search = SearchMemoryTool::new(store.clone());

        for text in ["likes tea", "likes coffee", "lives in Lisbon"] {
            manage.invoke(json!({"content": text}), &user("u-1")).await.unwrap();
        }
        manage.invoke(json!({"content": "likes tea too"}), &user("u-2")).await.unwrap();

        let hits = search.invoke(json!({"query": "LIKES"}), &user("u-1")).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r.namespace.segments()[1] == "u-1"));

        let page = search
            .invoke(json!({"query": "", "limit": 1, "offset": 1}), &user("u-1"))
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_search_filter_matches_structured_fields() {
        let store = Arc::new(InMemoryStore::new());
        let search = SearchMemoryTool::new(store.clone());
        let ns = Namespace::new(["memories", "u-1"]).unwrap();

        for (topic, value) in [("food", "tea"), ("food", "ramen"), ("travel", "Lisbon")] {
            store
                .put(&ns, Uuid::new_v4(), "Preference", json!({"topic": topic, "value": value}))
                .await
                .unwrap();
        }
        store.put(&ns, Uuid::new_v4(), TEXT_KIND, json!("food is fuel")).await.unwrap();

        let food = search
            .invoke(json!({"query": "", "filter": {"topic": "food"}}), &user("u-1"))
            .await
            .unwrap();
        assert_eq!(food.len(), 2);
        assert!(food.iter().all(|r| r.content["topic"] == "food"));

        let second = search
            .invoke(
                json!({"query": "", "filter": {"topic": "food"}, "limit": 5, "offset": 1}),
                &user("u-1"),
            )
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_tool_metadata() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let manage = ManageMemoryTool::new(store.clone()).with_instructions("Only store facts.");
        let search = SearchMemoryTool::new(store);

        assert_eq!(manage.name(), "manage_memory");
        assert!(manage.description().ends_with("Only store facts."));
        assert_eq!(search.name(), "search_memory");
        assert_eq!(search.input_schema()["required"], json!(["query"]));
    }
}
