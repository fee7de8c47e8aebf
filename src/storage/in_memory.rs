//! In-process store, handy for tests and short-lived agents

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{matches_query, MemoryStore};
use crate::error::Result;
use crate::memory::MemoryRecord;
use crate::namespace::Namespace;

/// A volatile [`MemoryStore`] kept entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    namespaces: RwLock<HashMap<Namespace, BTreeMap<Uuid, MemoryRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all namespaces
    pub async fn len(&self) -> usize {
        self.namespaces.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn oldest_first(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn snapshot(&self, namespace: &Namespace) -> Result<Vec<MemoryRecord>> {
        let namespaces = self.namespaces.read().await;
        let mut records: Vec<MemoryRecord> = namespaces
            .get(namespace)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        oldest_first(&mut records);
        Ok(records)
    }

    async fn get(&self, namespace: &Namespace, id: Uuid) -> Result<Option<MemoryRecord>> {
        let namespaces = self.namespaces.read().await;
        Ok(namespaces.get(namespace).and_then(|records| records.get(&id)).cloned())
    }

    async fn put(
        &self,
        namespace: &Namespace,
        id: Uuid,
        kind: &str,
        content: Value,
    ) -> Result<MemoryRecord> {
        let mut namespaces = self.namespaces.write().await;
        let records = namespaces.entry(namespace.clone()).or_default();

        let record = match records.get_mut(&id) {
            Some(existing) => {
                existing.revise(kind, content);
                existing.clone()
            }
            None => {
                let record = MemoryRecord::new(namespace.clone(), id, kind, content);
                records.insert(id, record.clone());
                record
            }
        };

        Ok(record)
    }

    async fn update(
        &self,
        namespace: &Namespace,
        id: Uuid,
        kind: &str,
        content: Value,
    ) -> Result<Option<MemoryRecord>> {
        let mut namespaces = self.namespaces.write().await;
        let Some(existing) = namespaces.get_mut(namespace).and_then(|r| r.get_mut(&id)) else {
            return Ok(None);
        };
        existing.revise(kind, content);
        Ok(Some(existing.clone()))
    }

    async fn delete(&self, namespace: &Namespace, id: Uuid) -> Result<bool> {
        let mut namespaces = self.namespaces.write().await;
        let Some(records) = namespaces.get_mut(namespace) else {
            return Ok(false);
        };
        let existed = records.remove(&id).is_some();
        if records.is_empty() {
            namespaces.remove(namespace);
        }
        Ok(existed)
    }

    async fn search(
        &self,
        prefix: &Namespace,
        query: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let query_lower = query.to_lowercase();
        let namespaces = self.namespaces.read().await;

        let mut hits: Vec<MemoryRecord> = namespaces
            .iter()
            .filter(|(ns, _)| prefix.is_prefix_of(ns))
            .flat_map(|(_, records)| records.values())
            .filter(|r| matches_query(r, &query_lower))
            .cloned()
            .collect();

        hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(hits.into_iter().skip(offset).take(limit).collect())
    }
}
