//! Carto core types: CRDs, status conditions and per-resource status bookkeeping.

#![forbid(unsafe_code)]

pub mod conditions;
pub mod crd;
pub mod resources;

pub use conditions::{Condition, ConditionManager, ConditionStatus};
pub use crd::*;
pub use resources::ResourceStatuses;

use kube::core::GroupVersionKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// API group of every carto kind.
pub const GROUP: &str = "carto.run";
pub const VERSION: &str = "v1alpha1";

/// Labels stamped onto every object the controller creates.
pub mod labels {
    pub const WORKLOAD_NAME: &str = "carto.run/workload-name";
    pub const WORKLOAD_NAMESPACE: &str = "carto.run/workload-namespace";
    pub const SUPPLY_CHAIN_NAME: &str = "carto.run/cluster-supply-chain-name";
    pub const RESOURCE_NAME: &str = "carto.run/resource-name";
    pub const TEMPLATE_KIND: &str = "carto.run/template-kind";
    pub const TEMPLATE_NAME: &str = "carto.run/cluster-template-name";
}

/// Namespace + name pair identifying a namespaced (or, with an empty namespace, cluster) object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() { write!(f, "{}", self.name) } else { write!(f, "{}/{}", self.namespace, self.name) }
    }
}

/// Reference to an object stamped out of a template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StampedRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl StampedRef {
    /// Build a reference from a raw object (`apiVersion`, `kind`, `metadata.{name,namespace}`).
    pub fn from_object(obj: &serde_json::Value) -> Option<Self> {
        let api_version = obj.get("apiVersion")?.as_str()?.to_string();
        let kind = obj.get("kind")?.as_str()?.to_string();
        let meta = obj.get("metadata")?;
        let name = meta.get("name")?.as_str()?.to_string();
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string());
        Some(Self { api_version, kind, namespace, name })
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = split_api_version(&self.api_version);
        GroupVersionKind::gvk(group, version, &self.kind)
    }

    /// Identity used for orphan detection: GVK, namespace and name.
    pub fn same_object(&self, other: &StampedRef) -> bool {
        self.gvk() == other.gvk() && self.namespace == other.namespace && self.name == other.name
    }
}

impl fmt::Display for StampedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Split `group/version` (or a bare core `version`) into its parts.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Render a GVK as `group/version/Kind` (or `version/Kind` for the core group).
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}
