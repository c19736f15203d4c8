//! Workload reconciliation: select a supply chain, realize it, track what was
//! read and stamped, clean up orphans and write the status.

use std::sync::Arc;

use carto_core::conditions::{
    missing_ready_in_supply_chain_condition, resource_realizer_builder_error_condition, resources_submitted_condition,
    service_account_secret_not_found_condition, supply_chain_not_found_condition, supply_chain_ready_condition,
    too_many_supply_chain_matches_condition, workload_missing_labels_condition, READY,
};
use carto_core::{
    ClusterSupplyChain, ConditionManager, NamespacedName, ResourceStatuses, SupplyChainRef, TemplateKind, Workload,
    WorkloadStatus,
};
use carto_kubehub::{Repository, StampedTracker};
use carto_realizer::{add_condition_for_resource_submitted, Realizer, ResourceRealizerBuilder};
use carto_store::{DependencyTracker, GroupKind, Key};
use kube::{Resource, ResourceExt};
use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::ReconcileError;

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Dependency key for a service account.
pub fn service_account_key(namespace: &str, name: &str) -> Key {
    Key::new(GroupKind::new("", "ServiceAccount"), NamespacedName::new(namespace, name))
}

/// Dependency key for a (cluster-scoped) template.
pub fn template_key(kind: TemplateKind, name: &str) -> Key {
    Key::new(GroupKind::new(carto_core::GROUP, kind.as_kind()), NamespacedName::cluster(name))
}

/// Service account used to stamp: workload's, else the chain's, else `default`.
pub fn resolve_service_account(workload: &Workload, chain: &ClusterSupplyChain) -> NamespacedName {
    let workload_ns = workload.namespace().unwrap_or_default();
    if let Some(name) = workload.spec.service_account_name.as_deref().filter(|n| !n.is_empty()) {
        return NamespacedName::new(workload_ns, name);
    }
    match chain.spec.service_account_ref.as_ref().filter(|r| !r.name.is_empty()) {
        Some(sa) => NamespacedName::new(sa.namespace.clone().filter(|n| !n.is_empty()).unwrap_or(workload_ns), sa.name.clone()),
        None => NamespacedName::new(workload_ns, DEFAULT_SERVICE_ACCOUNT),
    }
}

/// Per-pass state; never shared between reconciliations.
struct Pass {
    conditions: ConditionManager,
    resources: ResourceStatuses,
    supply_chain_ref: Option<SupplyChainRef>,
}

pub struct WorkloadReconciler {
    repo: Arc<dyn Repository>,
    builder: Arc<dyn ResourceRealizerBuilder>,
    realizer: Realizer,
    tracker: Arc<DependencyTracker>,
    stamped: Arc<dyn StampedTracker>,
}

impl WorkloadReconciler {
    pub fn new(
        repo: Arc<dyn Repository>,
        builder: Arc<dyn ResourceRealizerBuilder>,
        tracker: Arc<DependencyTracker>,
        stamped: Arc<dyn StampedTracker>,
    ) -> Self {
        Self { repo, builder, realizer: Realizer::new(), tracker, stamped }
    }

    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.tracker
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let key = NamespacedName::new(namespace, name);
        let Some(workload) = self.repo.get_workload(namespace, name).await? else {
            debug!(workload = %key, "workload not found, clearing tracked dependencies");
            self.tracker.clear_tracked(&key);
            return Ok(());
        };
        counter!("workload_reconcile_total", 1u64);
        debug!(workload = %key, generation = workload.metadata.generation.unwrap_or_default(), "reconciling workload");

        let status = workload.status_or_default();
        let mut pass = Pass {
            conditions: ConditionManager::new(READY, &status.conditions),
            resources: ResourceStatuses::new(status.resources.clone()),
            supply_chain_ref: status.supply_chain_ref.clone(),
        };
        let outcome = self.drive(&workload, &key, &mut pass).await;
        self.complete(&workload, &key, pass, outcome).await
    }

    /// Reconcile every workload once, in listing order.
    pub async fn reconcile_all(&self) -> Result<Vec<(NamespacedName, Result<(), ReconcileError>)>, ReconcileError> {
        let mut out = Vec::new();
        for w in self.repo.list_workloads().await? {
            let key = w.key();
            let res = self.reconcile(&key.namespace, &key.name).await;
            out.push((key, res));
        }
        Ok(out)
    }

    /// Everything up to finalization. `Err` is returned to the caller after the
    /// status has been written; user errors are conditions and yield `Ok`.
    async fn drive(&self, workload: &Workload, key: &NamespacedName, pass: &mut Pass) -> Result<(), ReconcileError> {
        let labels = workload.labels();
        if labels.is_empty() {
            pass.conditions.add_positive(workload_missing_labels_condition());
            return Ok(());
        }

        let mut chains = self.repo.get_supply_chains_for_workload(workload).await.map_err(ReconcileError::unhandled)?;
        let chain = match chains.len() {
            0 => {
                pass.conditions.add_positive(supply_chain_not_found_condition(labels.iter()));
                return Ok(());
            }
            1 => chains.remove(0),
            _ => {
                let mut names: Vec<String> = chains.iter().map(|c| c.name_any()).collect();
                names.sort();
                pass.conditions.add_positive(too_many_supply_chain_matches_condition(&names));
                return Ok(());
            }
        };
        pass.supply_chain_ref = Some(SupplyChainRef { kind: ClusterSupplyChain::kind(&()).to_string(), name: chain.name_any() });

        if !chain.is_ready() {
            pass.conditions.add_positive(missing_ready_in_supply_chain_condition(chain.ready_condition()));
            return Ok(());
        }
        pass.conditions.add_positive(supply_chain_ready_condition());

        let sa = resolve_service_account(workload, &chain);
        self.tracker.clear_tracked(key);
        self.tracker.track(service_account_key(&sa.namespace, &sa.name), key.clone());
        let secret = match self.repo.get_service_account_secret(&sa.name, &sa.namespace).await {
            Ok(secret) => secret,
            Err(e) if e.is_not_found() => {
                info!(workload = %key, service_account = %sa, error = %e, "service account secret not found");
                pass.conditions.add_positive(service_account_secret_not_found_condition(&e));
                return Ok(());
            }
            Err(e) => {
                warn!(workload = %key, service_account = %sa, error = %e, "failed to read service account secret");
                pass.conditions.add_positive(service_account_secret_not_found_condition(&e));
                return Err(e.into());
            }
        };

        let rr = match self.builder.build(workload, &chain, &secret) {
            Ok(rr) => rr,
            Err(e) => {
                pass.conditions.add_positive(resource_realizer_builder_error_condition(&e));
                return Err(ReconcileError::unhandled(e));
            }
        };

        let realized = self.realizer.realize(&rr, &chain, &mut pass.resources).await;
        let mut result = Ok(());
        match realized {
            Ok(()) => pass.conditions.add_positive(resources_submitted_condition()),
            Err(e) => {
                pass.conditions.add_positive(add_condition_for_resource_submitted(&e));
                if e.is_unhandled() {
                    result = Err(ReconcileError::unhandled(e));
                } else {
                    info!(workload = %key, kind = e.kind(), error = %e, "resources not fully submitted");
                }
            }
        }

        self.track_templates(key, pass)?;
        self.cleanup_orphans(key, pass).await;
        self.watch_stamped(pass).await?;
        result
    }

    fn track_templates(&self, key: &NamespacedName, pass: &Pass) -> Result<(), ReconcileError> {
        for tref in pass.resources.current().iter().filter_map(|s| s.template_ref.as_ref()) {
            let Some(kind) = TemplateKind::from_kind(&tref.kind) else { continue };
            self.repo.scheme().template_gvk(kind).map_err(ReconcileError::unhandled)?;
            self.tracker.track(template_key(kind, &tref.name), key.clone());
        }
        Ok(())
    }

    async fn cleanup_orphans(&self, key: &NamespacedName, pass: &Pass) {
        for orphan in pass.resources.orphans() {
            match self.repo.delete(&orphan).await {
                Ok(()) => {
                    counter!("orphan_delete_total", 1u64);
                    info!(workload = %key, object = %orphan, "deleted orphaned object");
                }
                Err(e) => warn!(workload = %key, object = %orphan, error = %e, "failed to delete orphaned object"),
            }
        }
    }

    /// Every stamped kind gets a watch attempt; the first failure is returned.
    async fn watch_stamped(&self, pass: &Pass) -> Result<(), ReconcileError> {
        let mut first_err = None;
        for stamped in pass.resources.current().iter().filter_map(|s| s.stamped_ref.as_ref()) {
            if let Err(e) = self.stamped.watch(&stamped.gvk()).await {
                warn!(object = %stamped, error = %e, "failed to watch stamped kind");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(ReconcileError::unhandled(e)),
            None => Ok(()),
        }
    }

    async fn complete(
        &self,
        workload: &Workload,
        key: &NamespacedName,
        pass: Pass,
        outcome: Result<(), ReconcileError>,
    ) -> Result<(), ReconcileError> {
        let (conditions, conditions_changed) = pass.conditions.finalize();
        let previous = workload.status_or_default();
        let generation = workload.metadata.generation.unwrap_or_default();
        let write = conditions_changed
            || previous.observed_generation != generation
            || pass.resources.is_changed()
            || previous.supply_chain_ref != pass.supply_chain_ref;

        if write {
            let mut updated = workload.clone();
            updated.status = Some(WorkloadStatus {
                observed_generation: generation,
                supply_chain_ref: pass.supply_chain_ref,
                conditions,
                resources: pass.resources.current().to_vec(),
            });
            self.repo.status_update(&updated).await?;
            debug!(workload = %key, "workload status written");
        }

        if let Err(e) = outcome {
            counter!("workload_reconcile_errors_total", 1u64, "kind" => e.metric_label());
            match &e {
                ReconcileError::Unhandled(_) => error!(workload = %key, error = %e, "reconcile failed"),
                ReconcileError::Transient(_) => warn!(workload = %key, error = %e, "reconcile failed, will retry"),
            }
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_core::{ServiceAccountRef, SupplyChainSpec, WorkloadSpec};

    fn workload(sa: Option<&str>) -> Workload {
        let mut w = Workload::new("app", WorkloadSpec { service_account_name: sa.map(String::from), ..Default::default() });
        w.metadata.namespace = Some("w1".into());
        w
    }

    fn chain(sa: Option<ServiceAccountRef>) -> ClusterSupplyChain {
        ClusterSupplyChain::new("sc1", SupplyChainSpec { service_account_ref: sa, ..Default::default() })
    }

    #[test]
    fn service_account_precedence() {
        let chain_sa = Some(ServiceAccountRef { name: "chain-sa".into(), namespace: Some("ops".into()) });
        assert_eq!(resolve_service_account(&workload(Some("builder")), &chain(chain_sa.clone())), NamespacedName::new("w1", "builder"));
        assert_eq!(resolve_service_account(&workload(None), &chain(chain_sa)), NamespacedName::new("ops", "chain-sa"));
        let no_ns = Some(ServiceAccountRef { name: "chain-sa".into(), namespace: None });
        assert_eq!(resolve_service_account(&workload(None), &chain(no_ns)), NamespacedName::new("w1", "chain-sa"));
        assert_eq!(resolve_service_account(&workload(Some("")), &chain(None)), NamespacedName::new("w1", "default"));
    }

    #[test]
    fn dependency_keys() {
        let k = template_key(TemplateKind::Generic, "dep-tpl");
        assert_eq!(k.group_kind, GroupKind::new("carto.run", "ClusterTemplate"));
        assert_eq!(k.object, NamespacedName::cluster("dep-tpl"));
        assert_eq!(service_account_key("w1", "default").group_kind.kind, "ServiceAccount");
    }
}
