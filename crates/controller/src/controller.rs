//! kube-runtime wiring: watches, mappers and the reconcile loop.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use carto_core::{
    ClusterConfigTemplate, ClusterImageTemplate, ClusterSourceTemplate, ClusterSupplyChain, ClusterTemplate, TemplateKind, Workload,
};
use carto_kubehub::{ClientBuilder, InformerTracker, KubeRepository, Repository, Scheme, SubmissionCache};
use carto_realizer::ScopedRealizerBuilder;
use carto_store::DependencyTracker;
use carto_templates::{Evaluator, JsonPathEvaluator};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::mappers;
use crate::{ReconcileError, WorkloadReconciler};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Requeue interval after a successful reconcile.
    pub resync: Duration,
    pub error_backoff: Duration,
    pub cache_ttl: Duration,
    /// Restrict workloads and stamped-object watches to one namespace.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(10 * 60 * 60),
            error_backoff: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(10 * 60),
            namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Dependency edges outlive two resync periods.
    pub fn tracker_ttl(&self) -> Duration {
        self.resync * 2
    }
}

struct Context {
    reconciler: WorkloadReconciler,
    resync: Duration,
    error_backoff: Duration,
}

async fn reconcile(workload: Arc<Workload>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let key = workload.key();
    ctx.reconciler.reconcile(&key.namespace, &key.name).await?;
    Ok(Action::requeue(ctx.resync))
}

fn error_policy(workload: Arc<Workload>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    debug!(workload = %workload.key(), error = %err, backoff_secs = ctx.error_backoff.as_secs(), "requeue after error");
    Action::requeue(ctx.error_backoff)
}

/// Keep a local cache of `K`, fed by its own watch.
fn reflect<K>(api: Api<K>) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default())).default_backoff().applied_objects();
    tokio::spawn(async move {
        futures::pin_mut!(stream);
        while let Some(res) = stream.next().await {
            if let Err(e) = res {
                warn!(error = %e, "reflector watch error");
            }
        }
    });
    reader
}

/// Shared pieces built from the controller's own credentials.
pub struct Components {
    pub repository: Arc<dyn Repository>,
    pub builder: Arc<ScopedRealizerBuilder>,
    pub tracker: Arc<DependencyTracker>,
    pub scheme: Arc<Scheme>,
}

impl Components {
    pub fn new(client: Client, kube_config: kube::Config, config: &ControllerConfig) -> Self {
        let scheme = Arc::new(Scheme::carto());
        let cache = Arc::new(SubmissionCache::new(config.cache_ttl));
        let evaluator: Arc<dyn Evaluator> = Arc::new(JsonPathEvaluator);
        let repository: Arc<dyn Repository> = Arc::new(KubeRepository::new(client, Arc::clone(&cache), Arc::clone(&scheme)));
        let builder = Arc::new(ScopedRealizerBuilder::new(ClientBuilder::new(kube_config), cache, Arc::clone(&scheme), evaluator));
        let tracker = Arc::new(DependencyTracker::new(config.tracker_ttl()));
        Self { repository, builder, tracker, scheme }
    }
}

/// Run the workload controller until a shutdown signal arrives.
pub async fn run(kube_config: kube::Config, config: ControllerConfig) -> Result<()> {
    let client = Client::try_from(kube_config.clone()).context("building controller client")?;
    let parts = Components::new(client.clone(), kube_config, &config);
    let (informers, stamped_events) = InformerTracker::new(client.clone(), Arc::clone(&parts.scheme), config.namespace.clone());
    let tracker = Arc::clone(&parts.tracker);
    let reconciler = WorkloadReconciler::new(parts.repository, parts.builder, Arc::clone(&tracker), Arc::new(informers));
    let ctx = Arc::new(Context { reconciler, resync: config.resync, error_backoff: config.error_backoff });

    let workloads: Api<Workload> = match config.namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let wc = watcher::Config::default;
    let controller = Controller::new(workloads, wc());
    let workload_store = controller.store();
    let role_bindings = reflect(Api::<RoleBinding>::all(client.clone()));
    let cluster_role_bindings = reflect(Api::<ClusterRoleBinding>::all(client.clone()));

    info!(resync_secs = config.resync.as_secs(), namespace = ?config.namespace, "workload controller starting");
    let t = Arc::clone(&tracker);
    let controller = controller
        .watches(Api::<ClusterSupplyChain>::all(client.clone()), wc(), move |chain| {
            mappers::supply_chain_to_workloads(&chain, &workload_store.state())
        })
        .watches(Api::<ServiceAccount>::all(client.clone()), wc(), move |sa| {
            mappers::service_account_to_workloads(&t, &sa.namespace().unwrap_or_default(), &sa.name_any())
        });
    let t = Arc::clone(&tracker);
    let controller = controller.watches(Api::<RoleBinding>::all(client.clone()), wc(), move |rb| mappers::role_binding_to_workloads(&t, &rb));
    let t = Arc::clone(&tracker);
    let controller = controller.watches(Api::<ClusterRoleBinding>::all(client.clone()), wc(), move |crb| {
        mappers::cluster_role_binding_to_workloads(&t, &crb)
    });
    let (t, rbs) = (Arc::clone(&tracker), role_bindings.clone());
    let controller = controller.watches(Api::<Role>::all(client.clone()), wc(), move |role| {
        mappers::role_to_workloads(&t, &role, &rbs.state())
    });
    let t = Arc::clone(&tracker);
    let controller = controller.watches(Api::<ClusterRole>::all(client.clone()), wc(), move |role| {
        mappers::cluster_role_to_workloads(&t, &role, &role_bindings.state(), &cluster_role_bindings.state())
    });
    let controller = watch_template::<ClusterSourceTemplate>(controller, &client, &tracker, TemplateKind::Source);
    let controller = watch_template::<ClusterConfigTemplate>(controller, &client, &tracker, TemplateKind::Config);
    let controller = watch_template::<ClusterImageTemplate>(controller, &client, &tracker, TemplateKind::Image);
    let controller = watch_template::<ClusterTemplate>(controller, &client, &tracker, TemplateKind::Generic);

    controller
        .reconcile_on(stamped_events)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(workload = %obj, "reconciled"),
                Err(e) => debug!(error = %e, "reconcile dispatch failed"),
            }
        })
        .await;
    info!("workload controller stopped");
    Ok(())
}

fn watch_template<K>(
    controller: Controller<Workload>,
    client: &Client,
    tracker: &Arc<DependencyTracker>,
    kind: TemplateKind,
) -> Controller<Workload>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let t = Arc::clone(tracker);
    controller.watches(Api::<K>::all(client.clone()), watcher::Config::default(), move |tpl| {
        mappers::template_to_workloads(&t, kind, &tpl.name_any())
    })
}
