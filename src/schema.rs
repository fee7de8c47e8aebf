//! Allowed content shapes for extracted memories

use std::collections::HashSet;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Kind used by the default free-text schema
pub const TEXT_KIND: &str = "Memory";

/// A named content shape the extractor may produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySchema {
    /// Kind tag stored on records following this schema
    pub name: String,

    /// Guidance shown to the extractor
    #[serde(default)]
    pub description: String,

    /// JSON Schema the content must satisfy
    pub parameters: Value,
}

impl MemorySchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Unstructured free-text memories
    pub fn text() -> Self {
        Self::new(
            TEXT_KIND,
            "A free-text memory worth keeping across conversations",
            json!({"type": "string"}),
        )
    }
}

/// Compiled validators for a set of schemas
#[derive(Debug)]
pub struct SchemaSet {
    entries: Vec<(String, JSONSchema)>,
}

impl SchemaSet {
    /// Compile every schema; an empty, duplicated or malformed set is a configuration error
    pub fn compile(schemas: &[MemorySchema]) -> Result<Self> {
        if schemas.is_empty() {
            return Err(Error::config("at least one memory schema is required"));
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(schemas.len());
        for schema in schemas {
            if schema.name.trim().is_empty() {
                return Err(Error::config("memory schema names must not be empty"));
            }
            if !seen.insert(schema.name.as_str()) {
                return Err(Error::config(format!("duplicate memory schema {:?}", schema.name)));
            }
            let validator = JSONSchema::compile(&schema.parameters).map_err(|e| {
                Error::config(format!("invalid schema {:?}: {}", schema.name, e))
            })?;
            entries.push((schema.name.clone(), validator));
        }

        Ok(Self { entries })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Check that `content` conforms to the schema registered under `kind`
    pub fn validate(&self, kind: &str, content: &Value) -> Result<()> {
        let (_, validator) = self
            .entries
            .iter()
            .find(|(name, _)| name == kind)
            .ok_or_else(|| Error::extraction(format!("unknown memory kind {:?}", kind)))?;

        if let Err(errors) = validator.validate(content) {
            let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
            return Err(Error::extraction(format!(
                "content does not match schema {:?}: {}",
                kind,
                messages.join("; ")
            )));
        }

        Ok(())
    }
}
