//! Hierarchical namespaces and `{placeholder}` templates

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator used when a namespace is rendered or persisted as a single string
pub const SEPARATOR: char = '/';

/// A fully resolved, ordered sequence of path segments
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace(Vec<String>);

impl Namespace {
    /// Build a namespace from literal segments
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment)?;
        }
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether `self` equals `other` or is an ancestor of it
    pub fn is_prefix_of(&self, other: &Namespace) -> bool {
        other.0.len() >= self.0.len() && other.0.iter().zip(&self.0).all(|(a, b)| a == b)
    }

    /// Parse the `a/b/c` form produced by `Display`
    pub fn parse(joined: &str) -> Result<Self> {
        if joined.is_empty() {
            return Ok(Self(Vec::new()));
        }
        Self::new(joined.split(SEPARATOR))
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(&SEPARATOR.to_string()))
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::config("namespace segments must not be empty"));
    }
    if segment.contains(SEPARATOR) {
        return Err(Error::config(format!(
            "namespace segment {:?} must not contain '{}'",
            segment, SEPARATOR
        )));
    }
    if segment.contains('{') || segment.contains('}') {
        return Err(Error::config(format!(
            "unresolved placeholder in namespace segment {:?}",
            segment
        )));
    }
    Ok(())
}

/// A namespace whose segments may embed `{name}` placeholders bound at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceTemplate(Vec<String>);

impl NamespaceTemplate {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Placeholder names referenced by this template, in order of appearance
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        for segment in &self.0 {
            let mut rest = segment.as_str();
            while let Some(start) = rest.find('{') {
                let after = &rest[start + 1..];
                match after.find('}') {
                    Some(end) => {
                        names.push(after[..end].to_string());
                        rest = &after[end + 1..];
                    }
                    None => break,
                }
            }
        }
        names
    }

    /// Bind every placeholder from `bindings`.
    ///
    /// Fails with a configuration error if any placeholder is left unbound
    /// or a segment resolves to something that is not a valid namespace segment.
    pub fn resolve(&self, bindings: &HashMap<String, String>) -> Result<Namespace> {
        let mut segments = Vec::with_capacity(self.0.len());
        for segment in &self.0 {
            segments.push(resolve_segment(segment, bindings)?);
        }
        Namespace::new(segments)
    }
}

impl From<Namespace> for NamespaceTemplate {
    fn from(namespace: Namespace) -> Self {
        Self(namespace.0)
    }
}

impl<S: Into<String>> From<Vec<S>> for NamespaceTemplate {
    fn from(segments: Vec<S>) -> Self {
        Self::new(segments)
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for NamespaceTemplate {
    fn from(segments: [S; N]) -> Self {
        Self::new(segments)
    }
}

impl std::fmt::Display for NamespaceTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(&SEPARATOR.to_string()))
    }
}

fn resolve_segment(segment: &str, bindings: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(segment.len());
    let mut rest = segment;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            Error::config(format!("unterminated placeholder in namespace segment {:?}", segment))
        })?;
        let name = &after[..end];
        let value = bindings.get(name).ok_or_else(|| {
            Error::config(format!("unresolved namespace placeholder {{{}}}", name))
        })?;
        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}
