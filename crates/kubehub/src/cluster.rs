//! `Repository` backed by a live API server.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use carto_core::{
    ClusterConfigTemplate, ClusterImageTemplate, ClusterSourceTemplate, ClusterSupplyChain, ClusterTemplate, StampedRef,
    Template, TemplateKind, TemplateRef, Workload,
};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::DynamicObject;
use kube::{Client, Resource, ResourceExt};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cache::{body_hash, SubmissionCache};
use crate::repository::{
    has_token, set_owner_reference, strip_managed_fields, Repository, FIELD_MANAGER, SERVICE_ACCOUNT_NAME_ANNOTATION,
    SERVICE_ACCOUNT_TOKEN_TYPE,
};
use crate::{RepoError, Scheme};

#[derive(Clone)]
pub struct KubeRepository {
    client: Client,
    cache: Arc<SubmissionCache>,
    scheme: Arc<Scheme>,
}

impl KubeRepository {
    pub fn new(client: Client, cache: Arc<SubmissionCache>, scheme: Arc<Scheme>) -> Self {
        Self { client, cache, scheme }
    }

    async fn get_cluster_scoped<K>(&self, name: &str) -> Result<Option<K>, RepoError>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    {
        Ok(Api::<K>::all(self.client.clone()).get_opt(name).await?)
    }

    async fn dynamic_api(&self, stamped: &StampedRef) -> Result<Api<DynamicObject>, RepoError> {
        let (ar, namespaced) = self.scheme.api_resource(&self.client, &stamped.gvk()).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match stamped.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(RepoError::InvalidObject(format!("{} is namespaced but has no namespace", stamped))),
        }
    }
}

#[async_trait]
impl Repository for KubeRepository {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>, RepoError> {
        Ok(Api::<Workload>::namespaced(self.client.clone(), namespace).get_opt(name).await?)
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>, RepoError> {
        Ok(Api::<Workload>::all(self.client.clone()).list(&ListParams::default()).await?.items)
    }

    async fn get_supply_chains_for_workload(&self, workload: &Workload) -> Result<Vec<ClusterSupplyChain>, RepoError> {
        let chains = Api::<ClusterSupplyChain>::all(self.client.clone()).list(&ListParams::default()).await?;
        let labels = workload.labels();
        Ok(chains.items.into_iter().filter(|c| c.selects(labels)).collect())
    }

    async fn get_service_account_secret(&self, name: &str, namespace: &str) -> Result<Secret, RepoError> {
        let sa = Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| RepoError::not_found("ServiceAccount", format!("{}/{}", namespace, name)))?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        for secret_ref in sa.secrets.unwrap_or_default() {
            let Some(secret_name) = secret_ref.name else { continue };
            if let Some(secret) = secrets.get_opt(&secret_name).await? {
                if has_token(&secret) {
                    return Ok(secret);
                }
            }
        }

        // Newer clusters no longer list token secrets on the account.
        let lp = ListParams::default().fields(&format!("type={}", SERVICE_ACCOUNT_TOKEN_TYPE));
        for secret in secrets.list(&lp).await?.items {
            let owned_by_sa = secret.annotations().get(SERVICE_ACCOUNT_NAME_ANNOTATION).map(|n| n == name).unwrap_or(false);
            if owned_by_sa && has_token(&secret) {
                return Ok(secret);
            }
        }
        Err(RepoError::not_found("token secret for ServiceAccount", format!("{}/{}", namespace, name)))
    }

    async fn get_template(&self, template_ref: &TemplateRef) -> Result<Template, RepoError> {
        let kind = TemplateKind::from_kind(&template_ref.kind).ok_or_else(|| RepoError::UnknownKind(template_ref.kind.clone()))?;
        let name = template_ref.name.as_str();
        let found = match kind {
            TemplateKind::Source => self.get_cluster_scoped::<ClusterSourceTemplate>(name).await?.map(Template::Source),
            TemplateKind::Config => self.get_cluster_scoped::<ClusterConfigTemplate>(name).await?.map(Template::Config),
            TemplateKind::Image => self.get_cluster_scoped::<ClusterImageTemplate>(name).await?.map(Template::Image),
            TemplateKind::Generic => self.get_cluster_scoped::<ClusterTemplate>(name).await?.map(Template::Generic),
        };
        found.ok_or_else(|| RepoError::not_found(kind.as_kind(), name))
    }

    async fn ensure_object_exists_on_cluster(&self, obj: &mut Value, owner: &OwnerReference) -> Result<(), RepoError> {
        set_owner_reference(obj, owner)?;
        let stamped = StampedRef::from_object(obj).ok_or_else(|| RepoError::InvalidObject("missing apiVersion, kind or metadata.name".into()))?;
        let api = self.dynamic_api(&stamped).await?;
        submit(&api, &self.cache, &stamped, obj).await
    }

    async fn status_update(&self, workload: &Workload) -> Result<(), RepoError> {
        let namespace = workload.namespace().ok_or_else(|| RepoError::InvalidObject("workload has no namespace".into()))?;
        let api: Api<Workload> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({ "status": workload.status });
        api.patch_status(&workload.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
        debug!(workload = %workload.key(), "status updated");
        Ok(())
    }

    async fn delete(&self, stamped: &StampedRef) -> Result<(), RepoError> {
        let api = self.dynamic_api(stamped).await?;
        self.cache.forget(stamped);
        match api.delete(&stamped.name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(object = %stamped, "deleted stamped object");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn scheme(&self) -> &Scheme {
        &self.scheme
    }
}

/// Where a stamped object is read from and applied to.
#[async_trait]
trait ApplyTarget: Send + Sync {
    async fn live(&self, name: &str) -> Result<Option<Value>, RepoError>;
    async fn apply(&self, name: &str, body: &Value) -> Result<Value, RepoError>;
}

#[async_trait]
impl ApplyTarget for Api<DynamicObject> {
    async fn live(&self, name: &str) -> Result<Option<Value>, RepoError> {
        match self.get_opt(name).await? {
            Some(live) => Ok(Some(serde_json::to_value(&live)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, name: &str, body: &Value) -> Result<Value, RepoError> {
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = self.patch(name, &pp, &Patch::Apply(body)).await?;
        Ok(serde_json::to_value(&applied)?)
    }
}

fn resource_version(obj: &Value) -> String {
    obj.pointer("/metadata/resourceVersion").and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Apply `obj` unless the cache shows this body was already submitted and the
/// live object has not been written since. `obj` is replaced by the live object.
async fn submit(target: &dyn ApplyTarget, cache: &SubmissionCache, stamped: &StampedRef, obj: &mut Value) -> Result<(), RepoError> {
    let hash = body_hash(obj);

    if let Some(live) = target.live(&stamped.name).await? {
        let live_rv = resource_version(&live);
        if cache.unchanged(stamped, &hash, &live_rv) {
            debug!(object = %stamped, rv = %live_rv, "submission unchanged, skipping apply");
            counter!("stamped_object_apply_skipped_total", 1u64);
            *obj = live;
            strip_managed_fields(obj);
            return Ok(());
        }
    }

    let applied = target.apply(&stamped.name, obj).await?;
    let rv = resource_version(&applied);
    info!(object = %stamped, rv = %rv, "applied stamped object");
    counter!("stamped_object_apply_total", 1u64);
    cache.record(stamped, hash, rv);
    *obj = applied;
    strip_managed_fields(obj);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Single-object API server: applies bump `resourceVersion` and keep `status`.
    #[derive(Default)]
    struct FakeTarget {
        live: Mutex<Option<Value>>,
        applies: Mutex<usize>,
        rv: Mutex<u64>,
    }

    impl FakeTarget {
        fn edit_out_of_band(&self) {
            let mut rv = self.rv.lock();
            *rv += 1;
            if let Some(live) = self.live.lock().as_mut() {
                live["metadata"]["resourceVersion"] = json!(rv.to_string());
            }
        }
    }

    #[async_trait]
    impl ApplyTarget for FakeTarget {
        async fn live(&self, _name: &str) -> Result<Option<Value>, RepoError> {
            Ok(self.live.lock().clone())
        }

        async fn apply(&self, _name: &str, body: &Value) -> Result<Value, RepoError> {
            *self.applies.lock() += 1;
            let mut rv = self.rv.lock();
            *rv += 1;
            let mut obj = body.clone();
            obj["metadata"]["resourceVersion"] = json!(rv.to_string());
            obj["metadata"]["managedFields"] = json!([{ "manager": FIELD_MANAGER }]);
            obj["status"] = json!({ "ready": true });
            *self.live.lock() = Some(obj.clone());
            Ok(obj)
        }
    }

    fn config_map(value: &str) -> Value {
        json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "app-cfg", "namespace": "w1" }, "data": { "v": value } })
    }

    async fn submit_body(target: &FakeTarget, cache: &SubmissionCache, value: &str) -> Value {
        let mut obj = config_map(value);
        let stamped = StampedRef::from_object(&obj).unwrap();
        submit(target, cache, &stamped, &mut obj).await.unwrap();
        obj
    }

    #[tokio::test]
    async fn unchanged_body_with_same_live_version_skips_apply() {
        let target = FakeTarget::default();
        let cache = SubmissionCache::new(Duration::from_secs(600));

        let first = submit_body(&target, &cache, "a").await;
        assert_eq!(*target.applies.lock(), 1);
        assert_eq!(first["status"]["ready"], json!(true));
        assert!(first["metadata"].get("managedFields").is_none());

        let second = submit_body(&target, &cache, "a").await;
        assert_eq!(*target.applies.lock(), 1);
        assert_eq!(second["metadata"]["resourceVersion"], json!("1"));
        assert_eq!(second["status"]["ready"], json!(true));
    }

    #[tokio::test]
    async fn new_body_or_foreign_write_reapplies() {
        let target = FakeTarget::default();
        let cache = SubmissionCache::new(Duration::from_secs(600));

        submit_body(&target, &cache, "a").await;
        submit_body(&target, &cache, "b").await;
        assert_eq!(*target.applies.lock(), 2);

        target.edit_out_of_band();
        submit_body(&target, &cache, "b").await;
        assert_eq!(*target.applies.lock(), 3);
        submit_body(&target, &cache, "b").await;
        assert_eq!(*target.applies.lock(), 3);
    }

    #[tokio::test]
    async fn missing_live_object_is_always_applied() {
        let target = FakeTarget::default();
        let cache = SubmissionCache::new(Duration::from_secs(600));
        submit_body(&target, &cache, "a").await;
        *target.live.lock() = None;
        submit_body(&target, &cache, "a").await;
        assert_eq!(*target.applies.lock(), 2);
    }
}
