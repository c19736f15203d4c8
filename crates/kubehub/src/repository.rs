//! The cluster-facing surface the reconciler and realizer work against.

use async_trait::async_trait;
use carto_core::{ClusterSupplyChain, StampedRef, Template, TemplateRef, Workload};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::Value;

use crate::{RepoError, Scheme};

/// Field manager used for every server-side apply.
pub const FIELD_MANAGER: &str = "carto-controller";
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

#[async_trait]
pub trait Repository: Send + Sync {
    /// `Ok(None)` when the workload does not exist.
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>, RepoError>;

    async fn list_workloads(&self) -> Result<Vec<Workload>, RepoError>;

    /// Every chain whose non-empty selector is satisfied by the workload's labels.
    async fn get_supply_chains_for_workload(&self, workload: &Workload) -> Result<Vec<ClusterSupplyChain>, RepoError>;

    /// First token-bearing secret belonging to the service account.
    async fn get_service_account_secret(&self, name: &str, namespace: &str) -> Result<Secret, RepoError>;

    async fn get_template(&self, template_ref: &TemplateRef) -> Result<Template, RepoError>;

    /// Create or patch `obj`, owned by `owner`. On return `obj` holds the live object.
    async fn ensure_object_exists_on_cluster(&self, obj: &mut Value, owner: &OwnerReference) -> Result<(), RepoError>;

    /// Write the status subresource only.
    async fn status_update(&self, workload: &Workload) -> Result<(), RepoError>;

    /// Delete by (GVK, namespace, name); a missing object is not an error.
    async fn delete(&self, stamped: &StampedRef) -> Result<(), RepoError>;

    fn scheme(&self) -> &Scheme;
}

/// Insert `owner` into `metadata.ownerReferences`, replacing any entry with the same uid.
pub fn set_owner_reference(obj: &mut Value, owner: &OwnerReference) -> Result<(), RepoError> {
    let owner_value = serde_json::to_value(owner)?;
    let meta = obj
        .as_object_mut()
        .ok_or_else(|| RepoError::InvalidObject("object is not a map".into()))?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    let meta = meta.as_object_mut().ok_or_else(|| RepoError::InvalidObject("metadata is not a map".into()))?;
    let refs = meta.entry("ownerReferences").or_insert_with(|| Value::Array(Vec::new()));
    let refs = refs.as_array_mut().ok_or_else(|| RepoError::InvalidObject("ownerReferences is not a list".into()))?;
    refs.retain(|r| r.get("uid").and_then(|u| u.as_str()) != Some(owner.uid.as_str()));
    refs.push(owner_value);
    Ok(())
}

/// A secret counts as a token secret when it carries a non-empty `token` key.
pub fn has_token(secret: &Secret) -> bool {
    secret.data.as_ref().and_then(|d| d.get("token")).map(|t| !t.0.is_empty()).unwrap_or(false)
}

/// Remove server-managed noise before handing a live object back to callers.
pub(crate) fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}
