//! Kind registry and API resource discovery cache.

use carto_core::{
    gvk_key, ClusterConfigTemplate, ClusterImageTemplate, ClusterSourceTemplate, ClusterSupplyChain, ClusterTemplate,
    TemplateKind, Workload,
};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::{Client, Resource};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::RepoError;

pub struct Scheme {
    kinds: FxHashMap<String, GroupVersionKind>,
    resources: RwLock<FxHashMap<String, (ApiResource, bool)>>,
}

impl Default for Scheme {
    fn default() -> Self {
        Self::carto()
    }
}

impl Scheme {
    pub fn empty() -> Self {
        Self { kinds: FxHashMap::default(), resources: RwLock::new(FxHashMap::default()) }
    }

    /// Every kind the controller reads or watches by type.
    pub fn carto() -> Self {
        let mut s = Self::empty();
        s.register::<Workload>();
        s.register::<ClusterSupplyChain>();
        s.register::<ClusterSourceTemplate>();
        s.register::<ClusterConfigTemplate>();
        s.register::<ClusterImageTemplate>();
        s.register::<ClusterTemplate>();
        s.register::<ServiceAccount>();
        s.register::<Secret>();
        s.register::<Role>();
        s.register::<RoleBinding>();
        s.register::<ClusterRole>();
        s.register::<ClusterRoleBinding>();
        s
    }

    pub fn register<K: Resource<DynamicType = ()>>(&mut self) {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        self.kinds.insert(gvk.kind.clone(), gvk);
    }

    pub fn object_gvk(&self, kind: &str) -> Result<GroupVersionKind, RepoError> {
        self.kinds.get(kind).cloned().ok_or_else(|| RepoError::UnknownKind(kind.to_string()))
    }

    pub fn template_gvk(&self, kind: TemplateKind) -> Result<GroupVersionKind, RepoError> {
        self.object_gvk(kind.as_kind())
    }

    /// Resolve (and memoize) the API resource serving `gvk` and whether it is namespaced.
    pub async fn api_resource(&self, client: &Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), RepoError> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.resources.read().get(&key) {
            return Ok(hit.clone());
        }
        let (ar, caps) = discovery::pinned_kind(client, gvk).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %key, plural = %ar.plural, namespaced, "discovered api resource");
        self.resources.write().insert(key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }
}
