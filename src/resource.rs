//! Process-level resource attributes attached to every export.

use crate::span::AttributeValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An immutable set of key/value pairs describing the process.
///
/// A resource is attached to every span and metric export for the lifetime
/// of the owning processor or reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    attributes: BTreeMap<String, AttributeValue>,
}

impl Resource {
    /// An empty resource.
    pub fn empty() -> Self {
        Self {
            attributes: BTreeMap::new(),
        }
    }

    /// Builds a resource from key/value pairs.
    pub fn new(pairs: impl IntoIterator<Item = (String, AttributeValue)>) -> Self {
        Self {
            attributes: pairs.into_iter().collect(),
        }
    }

    /// Detects the default process resource.
    ///
    /// Called at processor/reader init when no resource is supplied.
    pub fn detect() -> Self {
        Self::new([
            (
                "service.name".to_string(),
                AttributeValue::String("unknown_service".to_string()),
            ),
            (
                "process.pid".to_string(),
                AttributeValue::Int(std::process::id() as i64),
            ),
            (
                "os.type".to_string(),
                AttributeValue::String(std::env::consts::OS.to_string()),
            ),
            (
                "telemetry.sdk.name".to_string(),
                AttributeValue::String("otel-pipeline".to_string()),
            ),
            (
                "telemetry.sdk.language".to_string(),
                AttributeValue::String("rust".to_string()),
            ),
        ])
    }

    /// Returns a copy of this resource with the given pairs layered on top.
    pub fn merged(&self, pairs: impl IntoIterator<Item = (String, AttributeValue)>) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.extend(pairs);
        Self { attributes }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
