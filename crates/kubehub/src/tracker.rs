//! Watches on stamped objects, one informer per GVK, feeding owner workloads
//! back into the controller.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use carto_core::{gvk_key, Workload, GROUP};
use futures::channel::mpsc;
use futures::TryStreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use metrics::counter;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::{RepoError, Scheme};

#[async_trait]
pub trait StampedTracker: Send + Sync {
    /// Ensure a watch exists for `gvk`. Idempotent per GVK.
    async fn watch(&self, gvk: &GroupVersionKind) -> Result<(), RepoError>;
}

pub type WorkloadRequests = mpsc::UnboundedReceiver<ObjectRef<Workload>>;

/// GVKs with a running watch.
#[derive(Default)]
struct Registry {
    keys: Mutex<FxHashSet<String>>,
}

impl Registry {
    /// Run `start` the first time `key` is seen. A failed start releases the
    /// key so a later call retries. Returns whether `start` ran and succeeded.
    async fn ensure<F, Fut>(&self, key: &str, start: F) -> Result<bool, RepoError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), RepoError>>,
    {
        if !self.keys.lock().insert(key.to_string()) {
            return Ok(false);
        }
        if let Err(e) = start().await {
            self.keys.lock().remove(key);
            return Err(e);
        }
        Ok(true)
    }
}

pub struct InformerTracker {
    client: Client,
    scheme: Arc<Scheme>,
    namespace: Option<String>,
    tx: mpsc::UnboundedSender<ObjectRef<Workload>>,
    registered: Registry,
}

impl InformerTracker {
    /// The receiver yields owner workloads of changed stamped objects.
    pub fn new(client: Client, scheme: Arc<Scheme>, namespace: Option<String>) -> (Self, WorkloadRequests) {
        let (tx, rx) = mpsc::unbounded();
        let tracker = Self { client, scheme, namespace, tx, registered: Registry::default() };
        (tracker, rx)
    }

    async fn start(&self, gvk: &GroupVersionKind, key: &str) -> Result<(), RepoError> {
        let (ar, namespaced) = self.scheme.api_resource(&self.client, gvk).await?;
        let api: Api<DynamicObject> = match (namespaced, self.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        tokio::spawn(run_watch(api, key.to_string(), self.tx.clone()));
        Ok(())
    }
}

#[async_trait]
impl StampedTracker for InformerTracker {
    async fn watch(&self, gvk: &GroupVersionKind) -> Result<(), RepoError> {
        let key = gvk_key(gvk);
        if self.registered.ensure(&key, || self.start(gvk, &key)).await? {
            counter!("stamped_watch_started_total", 1u64);
            info!(gvk = %key, "stamped object watch started");
        }
        Ok(())
    }
}

async fn run_watch(api: Api<DynamicObject>, key: String, tx: mpsc::UnboundedSender<ObjectRef<Workload>>) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    loop {
        match stream.try_next().await {
            Ok(Some(ev)) => {
                let objs: Vec<DynamicObject> = match ev {
                    Event::Applied(o) | Event::Deleted(o) => vec![o],
                    Event::Restarted(list) => {
                        debug!(gvk = %key, count = list.len(), "watch restart");
                        list
                    }
                };
                for o in objs.iter() {
                    for owner in workload_owners(&o.metadata) {
                        if tx.unbounded_send(owner).is_err() {
                            debug!(gvk = %key, "controller gone, stopping watch");
                            return;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => warn!(gvk = %key, error = %e, "stamped object watch error"),
        }
    }
    warn!(gvk = %key, "stamped object watch ended");
}

/// Workloads listed as owners of an object.
pub fn workload_owners(meta: &ObjectMeta) -> Vec<ObjectRef<Workload>> {
    let Some(ns) = meta.namespace.as_deref() else { return Vec::new() };
    meta.owner_references
        .iter()
        .flatten()
        .filter(|r| r.kind == "Workload" && r.api_version.split('/').next() == Some(GROUP))
        .map(|r| ObjectRef::new(&r.name).within(ns))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner_ref(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference { api_version: api_version.into(), kind: kind.into(), name: name.into(), uid: "u".into(), ..Default::default() }
    }

    #[test]
    fn only_carto_workload_owners_are_mapped() {
        let meta = ObjectMeta {
            name: Some("app-deploy".into()),
            namespace: Some("w1".into()),
            owner_references: Some(vec![
                owner_ref("carto.run/v1alpha1", "Workload", "app"),
                owner_ref("apps/v1", "ReplicaSet", "rs"),
                owner_ref("other.io/v1", "Workload", "foreign"),
            ]),
            ..Default::default()
        };
        let owners = workload_owners(&meta);
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "app");
        assert_eq!(owners[0].namespace.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn registry_starts_each_key_once() {
        let registry = Registry::default();
        let count = Mutex::new(0usize);
        let starts = &count;
        let start = || async move {
            *starts.lock() += 1;
            Ok(())
        };
        assert!(registry.ensure("apps/v1/Deployment", start).await.unwrap());
        assert!(!registry.ensure("apps/v1/Deployment", start).await.unwrap());
        assert!(registry.ensure("v1/ConfigMap", start).await.unwrap());
        assert_eq!(*count.lock(), 2);
    }

    #[tokio::test]
    async fn failed_start_is_retried_on_next_call() {
        let registry = Registry::default();
        let err = registry
            .ensure("example.dev/v1/Widget", || async { Err(RepoError::UnknownKind("Widget".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::UnknownKind(_)));
        assert!(!registry.keys.lock().contains("example.dev/v1/Widget"));
        assert!(registry.ensure("example.dev/v1/Widget", || async { Ok(()) }).await.unwrap());
        assert!(registry.keys.lock().contains("example.dev/v1/Widget"));
    }

    #[test]
    fn cluster_scoped_objects_have_no_workload_owner() {
        let meta = ObjectMeta {
            name: Some("x".into()),
            owner_references: Some(vec![owner_ref("carto.run/v1alpha1", "Workload", "app")]),
            ..Default::default()
        };
        assert!(workload_owners(&meta).is_empty());
    }
}
