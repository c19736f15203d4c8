//! In-memory `Repository` used by tests and local dry runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use carto_core::{ClusterSupplyChain, NamespacedName, StampedRef, Template, TemplateKind, TemplateRef, Workload, WorkloadStatus};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::{set_owner_reference, Repository};
use crate::{RepoError, Scheme};

#[derive(Default)]
struct State {
    workloads: BTreeMap<NamespacedName, Workload>,
    chains: Vec<ClusterSupplyChain>,
    // keyed by the owning service account
    secrets: BTreeMap<NamespacedName, Secret>,
    templates: BTreeMap<(String, String), Template>,
    objects: BTreeMap<String, Value>,
    rejected: BTreeMap<String, String>,
    secret_failure: Option<String>,
    applies: Vec<StampedRef>,
    deletes: Vec<StampedRef>,
    status_writes: Vec<(NamespacedName, WorkloadStatus)>,
    next_rv: u64,
}

/// Keeps every object in a map. Applies preserve the live `status` (as the API
/// server does) and only bump `resourceVersion` when the object changed.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
    scheme: Scheme,
}

fn object_key(r: &StampedRef) -> String {
    format!("{}/{}/{}/{}", r.api_version, r.kind, r.namespace.as_deref().unwrap_or(""), r.name)
}

fn without_version(v: &Value) -> Value {
    let mut v = v.clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("resourceVersion");
    }
    v
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a workload, filling in uid and generation when absent.
    pub fn put_workload(&self, mut workload: Workload) {
        if workload.metadata.uid.is_none() {
            workload.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        if workload.metadata.generation.is_none() {
            workload.metadata.generation = Some(1);
        }
        self.state.lock().workloads.insert(workload.key(), workload);
    }

    pub fn remove_workload(&self, key: &NamespacedName) -> Option<Workload> {
        self.state.lock().workloads.remove(key)
    }

    pub fn workload(&self, key: &NamespacedName) -> Option<Workload> {
        self.state.lock().workloads.get(key).cloned()
    }

    pub fn put_supply_chain(&self, chain: ClusterSupplyChain) {
        let mut st = self.state.lock();
        let name = chain.name_any();
        st.chains.retain(|c| c.name_any() != name);
        st.chains.push(chain);
    }

    pub fn put_service_account_secret(&self, service_account: NamespacedName, secret: Secret) {
        self.state.lock().secrets.insert(service_account, secret);
    }

    pub fn put_template(&self, template: Template) {
        let key = (template.kind().as_kind().to_string(), template.name());
        self.state.lock().templates.insert(key, template);
    }

    pub fn remove_template(&self, kind: TemplateKind, name: &str) {
        self.state.lock().templates.remove(&(kind.as_kind().to_string(), name.to_string()));
    }

    /// Simulate the object's own controller writing its status.
    pub fn set_object_status(&self, stamped: &StampedRef, status: Value) {
        let mut st = self.state.lock();
        st.next_rv += 1;
        let rv = st.next_rv.to_string();
        if let Some(obj) = st.objects.get_mut(&object_key(stamped)) {
            obj["status"] = status;
            obj["metadata"]["resourceVersion"] = Value::String(rv);
        }
    }

    /// Make applies of objects named `name` fail as an API-server rejection.
    pub fn reject_applies_of(&self, name: &str, message: &str) {
        self.state.lock().rejected.insert(name.to_string(), message.to_string());
    }

    /// Make service account secret reads fail as an API-server outage; `None` restores them.
    pub fn fail_secret_reads(&self, message: Option<&str>) {
        self.state.lock().secret_failure = message.map(str::to_string);
    }

    pub fn object(&self, stamped: &StampedRef) -> Option<Value> {
        self.state.lock().objects.get(&object_key(stamped)).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn applies(&self) -> Vec<StampedRef> {
        self.state.lock().applies.clone()
    }

    pub fn deletes(&self) -> Vec<StampedRef> {
        self.state.lock().deletes.clone()
    }

    pub fn status_writes(&self) -> Vec<(NamespacedName, WorkloadStatus)> {
        self.state.lock().status_writes.clone()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<Workload>, RepoError> {
        Ok(self.state.lock().workloads.get(&NamespacedName::new(namespace, name)).cloned())
    }

    async fn list_workloads(&self) -> Result<Vec<Workload>, RepoError> {
        Ok(self.state.lock().workloads.values().cloned().collect())
    }

    async fn get_supply_chains_for_workload(&self, workload: &Workload) -> Result<Vec<ClusterSupplyChain>, RepoError> {
        let labels = workload.labels();
        Ok(self.state.lock().chains.iter().filter(|c| c.selects(labels)).cloned().collect())
    }

    async fn get_service_account_secret(&self, name: &str, namespace: &str) -> Result<Secret, RepoError> {
        let st = self.state.lock();
        if let Some(message) = &st.secret_failure {
            return Err(RepoError::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: message.clone(),
                reason: "InternalError".into(),
                code: 500,
            })));
        }
        st.secrets
            .get(&NamespacedName::new(namespace, name))
            .cloned()
            .ok_or_else(|| RepoError::not_found("token secret for ServiceAccount", format!("{}/{}", namespace, name)))
    }

    async fn get_template(&self, template_ref: &TemplateRef) -> Result<Template, RepoError> {
        let kind = TemplateKind::from_kind(&template_ref.kind).ok_or_else(|| RepoError::UnknownKind(template_ref.kind.clone()))?;
        self.state
            .lock()
            .templates
            .get(&(kind.as_kind().to_string(), template_ref.name.clone()))
            .cloned()
            .ok_or_else(|| RepoError::not_found(kind.as_kind(), &template_ref.name))
    }

    async fn ensure_object_exists_on_cluster(&self, obj: &mut Value, owner: &OwnerReference) -> Result<(), RepoError> {
        set_owner_reference(obj, owner)?;
        let stamped = StampedRef::from_object(obj).ok_or_else(|| RepoError::InvalidObject("missing apiVersion, kind or metadata.name".into()))?;
        let mut st = self.state.lock();
        if let Some(message) = st.rejected.get(&stamped.name) {
            return Err(RepoError::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: message.clone(),
                reason: "Invalid".into(),
                code: 422,
            })));
        }

        let key = object_key(&stamped);
        let mut merged = obj.clone();
        let existing = st.objects.get(&key).cloned();
        if let Some(status) = existing.as_ref().and_then(|e| e.get("status")) {
            merged["status"] = status.clone();
        }
        let unchanged = existing.as_ref().map(|e| without_version(e) == without_version(&merged)).unwrap_or(false);
        if !unchanged {
            st.next_rv += 1;
            merged["metadata"]["resourceVersion"] = Value::String(st.next_rv.to_string());
            st.objects.insert(key.clone(), merged);
            st.applies.push(stamped);
        }
        if let Some(live) = st.objects.get(&key) {
            *obj = live.clone();
        }
        Ok(())
    }

    async fn status_update(&self, workload: &Workload) -> Result<(), RepoError> {
        let key = workload.key();
        let mut st = self.state.lock();
        let stored = st.workloads.get_mut(&key).ok_or_else(|| RepoError::not_found("Workload", key.to_string()))?;
        stored.status = workload.status.clone();
        let status = workload.status_or_default();
        st.status_writes.push((key, status));
        Ok(())
    }

    async fn delete(&self, stamped: &StampedRef) -> Result<(), RepoError> {
        let mut st = self.state.lock();
        st.objects.remove(&object_key(stamped));
        st.deletes.push(stamped.clone());
        Ok(())
    }

    fn scheme(&self) -> &Scheme {
        &self.scheme
    }
}
