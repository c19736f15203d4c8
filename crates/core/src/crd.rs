//! Custom resources consumed by the controller.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Condition, StampedRef};

/// A named, arbitrarily-typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

// ---------------- Workload ----------------

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "Workload",
    namespaced,
    status = "WorkloadStatus",
    shortname = "wl",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<WorkloadSource>,
    /// Pre-built image, when the workload skips building from source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GitSource {
    pub url: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<GitRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GitRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supply_chain_ref: Option<SupplyChainRef>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SupplyChainRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamped_ref: Option<StampedRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ResourceInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputDescriptor>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceInput {
    pub name: String,
}

/// Operator-facing summary of one output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputDescriptor {
    pub name: String,
    pub preview: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl Workload {
    /// Identity of this workload as used by the trackers.
    pub fn key(&self) -> crate::NamespacedName {
        crate::NamespacedName::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn status_or_default(&self) -> WorkloadStatus {
        self.status.clone().unwrap_or_default()
    }
}

// ---------------- ClusterSupplyChain ----------------

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "ClusterSupplyChain",
    status = "SupplyChainStatus",
    shortname = "csc"
)]
#[serde(rename_all = "camelCase")]
pub struct SupplyChainSpec {
    /// Labels a workload must carry, all of them, to select this chain.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_ref: Option<ServiceAccountRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    pub resources: Vec<SupplyChainResource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceAccountRef {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SupplyChainResource {
    pub name: String,
    pub template_ref: TemplateRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ResourceBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ResourceBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ResourceBinding>,
}

impl SupplyChainResource {
    /// Names of every upstream entry this one consumes, in declaration order.
    pub fn upstream(&self) -> impl Iterator<Item = &str> {
        self.sources.iter().chain(self.images.iter()).chain(self.configs.iter()).map(|b| b.resource.as_str())
    }
}

/// Input binding: consume the output of entry `resource`, exposed to stamping as `name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceBinding {
    pub name: String,
    pub resource: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct TemplateRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SupplyChainStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ClusterSupplyChain {
    /// True when every selector label is present on `labels` with the same value.
    /// An empty selector selects nothing.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.spec.selector.is_empty() && self.spec.selector.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    pub fn ready_condition(&self) -> Option<&Condition> {
        self.status.as_ref()?.conditions.iter().find(|c| c.type_ == crate::conditions::READY)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_condition().map(|c| c.status == crate::ConditionStatus::True).unwrap_or(false)
    }
}

// ---------------- Templates ----------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateParam {
    pub name: String,
    #[serde(default, rename = "default")]
    pub default_value: Value,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "carto.run", version = "v1alpha1", kind = "ClusterSourceTemplate")]
#[serde(rename_all = "camelCase")]
pub struct SourceTemplateSpec {
    pub template: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
    pub url_path: String,
    pub revision_path: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "carto.run", version = "v1alpha1", kind = "ClusterConfigTemplate")]
#[serde(rename_all = "camelCase")]
pub struct ConfigTemplateSpec {
    pub template: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
    pub config_path: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "carto.run", version = "v1alpha1", kind = "ClusterImageTemplate")]
#[serde(rename_all = "camelCase")]
pub struct ImageTemplateSpec {
    pub template: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
    pub image_path: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "carto.run", version = "v1alpha1", kind = "ClusterTemplate")]
#[serde(rename_all = "camelCase")]
pub struct GenericTemplateSpec {
    pub template: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
}

/// The four template kinds a supply chain entry may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Source,
    Config,
    Image,
    Generic,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 4] = [TemplateKind::Source, TemplateKind::Config, TemplateKind::Image, TemplateKind::Generic];

    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "ClusterSourceTemplate" => Some(Self::Source),
            "ClusterConfigTemplate" => Some(Self::Config),
            "ClusterImageTemplate" => Some(Self::Image),
            "ClusterTemplate" => Some(Self::Generic),
            _ => None,
        }
    }

    pub fn as_kind(&self) -> &'static str {
        match self {
            Self::Source => "ClusterSourceTemplate",
            Self::Config => "ClusterConfigTemplate",
            Self::Image => "ClusterImageTemplate",
            Self::Generic => "ClusterTemplate",
        }
    }
}

/// A fetched template object of any kind.
#[derive(Debug, Clone)]
pub enum Template {
    Source(ClusterSourceTemplate),
    Config(ClusterConfigTemplate),
    Image(ClusterImageTemplate),
    Generic(ClusterTemplate),
}

impl Template {
    pub fn kind(&self) -> TemplateKind {
        match self {
            Self::Source(_) => TemplateKind::Source,
            Self::Config(_) => TemplateKind::Config,
            Self::Image(_) => TemplateKind::Image,
            Self::Generic(_) => TemplateKind::Generic,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Source(t) => t.name_any(),
            Self::Config(t) => t.name_any(),
            Self::Image(t) => t.name_any(),
            Self::Generic(t) => t.name_any(),
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Self::Source(t) => &t.spec.template,
            Self::Config(t) => &t.spec.template,
            Self::Image(t) => &t.spec.template,
            Self::Generic(t) => &t.spec.template,
        }
    }

    pub fn params(&self) -> &[TemplateParam] {
        match self {
            Self::Source(t) => &t.spec.params,
            Self::Config(t) => &t.spec.params,
            Self::Image(t) => &t.spec.params,
            Self::Generic(t) => &t.spec.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConditionStatus;

    fn chain(selector: &[(&str, &str)]) -> ClusterSupplyChain {
        let mut sc = ClusterSupplyChain::new("sc1", SupplyChainSpec {
            selector: selector.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        });
        sc.status = Some(SupplyChainStatus {
            observed_generation: 1,
            conditions: vec![Condition::new(crate::conditions::READY, ConditionStatus::True, "Ready")],
        });
        sc
    }

    #[test]
    fn selector_requires_every_label() {
        let sc = chain(&[("type", "web"), ("team", "a")]);
        let mut labels = BTreeMap::new();
        labels.insert("type".to_string(), "web".to_string());
        assert!(!sc.selects(&labels));
        labels.insert("team".to_string(), "a".to_string());
        labels.insert("extra".to_string(), "x".to_string());
        assert!(sc.selects(&labels));
    }

    #[test]
    fn empty_selector_selects_nothing() {
        let sc = chain(&[]);
        let labels: BTreeMap<_, _> = [("type".to_string(), "web".to_string())].into_iter().collect();
        assert!(!sc.selects(&labels));
    }

    #[test]
    fn readiness_follows_ready_condition() {
        let mut sc = chain(&[("type", "web")]);
        assert!(sc.is_ready());
        sc.status = None;
        assert!(!sc.is_ready());
    }

    #[test]
    fn template_kinds_round_trip_names() {
        for kind in TemplateKind::ALL {
            assert_eq!(TemplateKind::from_kind(kind.as_kind()), Some(kind));
        }
        assert_eq!(TemplateKind::from_kind("Pipeline"), None);
        let t = Template::Source(ClusterSourceTemplate::new("git", SourceTemplateSpec {
            template: serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap" }),
            params: vec![],
            url_path: ".status.url".into(),
            revision_path: ".status.revision".into(),
        }));
        assert_eq!(t.kind(), TemplateKind::Source);
        assert_eq!(t.name(), "git");
        assert!(t.params().is_empty());
    }
}
