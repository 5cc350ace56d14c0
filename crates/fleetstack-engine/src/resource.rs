//! Resource records as persisted in snapshots

use crate::urn::{ProviderReference, Urn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered property bag; ordering keeps fingerprints and snapshot files deterministic
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

/// State of a single resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub urn: Urn,

    /// Provider-assigned ID, absent until created (and always for components)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub resource_type: String,

    /// Custom resources are managed by a provider; components are logical groupings
    pub custom: bool,

    #[serde(default)]
    pub inputs: PropertyMap,

    #[serde(default)]
    pub outputs: PropertyMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,

    #[serde(default)]
    pub protect: bool,

    /// Read from an existing resource, never created or deleted by the engine
    #[serde(default)]
    pub external: bool,

    /// Replaced resource whose deletion has not succeeded yet
    #[serde(default)]
    pub pending_delete: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    pub fn new(urn: Urn, resource_type: impl Into<String>, custom: bool) -> Self {
        let now = Utc::now();
        Self {
            urn,
            id: None,
            resource_type: resource_type.into(),
            custom,
            inputs: PropertyMap::new(),
            outputs: PropertyMap::new(),
            provider: None,
            parent: None,
            dependencies: Vec::new(),
            protect: false,
            external: false,
            pending_delete: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_inputs(mut self, inputs: PropertyMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: PropertyMap) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_provider(mut self, provider: ProviderReference) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_parent(mut self, parent: Urn) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Urn>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn is_provider(&self) -> bool {
        self.urn.is_provider()
    }

    /// Backed by a real plugin resource the engine creates and deletes
    pub fn is_managed(&self) -> bool {
        self.custom && !self.external && !self.is_provider()
    }

    /// Key distinguishing a live record from replaced copies sharing its URN
    pub fn key(&self) -> RecordKey {
        RecordKey {
            urn: self.urn.clone(),
            id: self.id.clone(),
            pending_delete: self.pending_delete,
        }
    }

    /// Every URN this record must follow in a snapshot: dependencies, parent and provider
    pub fn referenced_urns(&self) -> impl Iterator<Item = &Urn> {
        self.dependencies
            .iter()
            .chain(self.parent.iter())
            .chain(self.provider.iter().map(ProviderReference::urn))
    }

    pub fn references(&self, urn: &Urn) -> bool {
        self.referenced_urns().any(|u| u == urn)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub urn: Urn,
    pub id: Option<String>,
    pub pending_delete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(name: &str) -> Urn {
        Urn::new("dev", "web", None, "pkgA:m:typA", name)
    }

    #[test]
    fn test_referenced_urns_include_parent_and_provider() {
        let provider_urn = Urn::new("dev", "web", None, "fleetstack:providers:pkgA", "default");
        let record = ResourceRecord::new(urn("child"), "pkgA:m:typA", true)
            .with_parent(urn("parent"))
            .with_dependencies(vec![urn("db")])
            .with_provider(ProviderReference::new(provider_urn.clone(), "p1"));

        let referenced: Vec<&Urn> = record.referenced_urns().collect();
        assert_eq!(referenced.len(), 3);
        assert!(record.references(&provider_urn));
        assert!(record.references(&urn("db")));
        assert!(!record.references(&urn("other")));
    }

    #[test]
    fn test_record_serialization_skips_empty_fields() {
        let record = ResourceRecord::new(urn("a"), "pkgA:m:typA", false);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("provider").is_none());
        assert_eq!(json["type"], "pkgA:m:typA");

        let back: ResourceRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
