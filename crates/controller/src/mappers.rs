//! Map events on upstream objects to the workloads that must be reconciled.

use std::sync::Arc;

use carto_core::{ClusterSupplyChain, NamespacedName, TemplateKind, Workload};
use carto_store::{DependencyTracker, Owners};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, Subject};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::reconciler::{service_account_key, template_key};

fn to_refs(owners: Owners) -> impl Iterator<Item = ObjectRef<Workload>> {
    owners.into_iter().map(|o| ObjectRef::new(&o.name).within(&o.namespace))
}

/// Workloads whose labels satisfy the chain's selector.
pub fn supply_chain_to_workloads(chain: &ClusterSupplyChain, workloads: &[Arc<Workload>]) -> Vec<ObjectRef<Workload>> {
    workloads.iter().filter(|w| chain.selects(w.labels())).map(|w| ObjectRef::from_obj(w.as_ref())).collect()
}

pub fn service_account_to_workloads(tracker: &DependencyTracker, namespace: &str, name: &str) -> Vec<ObjectRef<Workload>> {
    to_refs(tracker.lookup(&service_account_key(namespace, name))).collect()
}

pub fn template_to_workloads(tracker: &DependencyTracker, kind: TemplateKind, name: &str) -> Vec<ObjectRef<Workload>> {
    to_refs(tracker.lookup(&template_key(kind, name))).collect()
}

/// Service-account subjects, with `default_ns` for subjects that omit one.
fn service_accounts<'a>(subjects: &'a [Subject], default_ns: Option<&'a str>) -> impl Iterator<Item = NamespacedName> + 'a {
    subjects.iter().filter(|s| s.kind == "ServiceAccount").filter_map(move |s| {
        let ns = s.namespace.as_deref().or(default_ns)?;
        Some(NamespacedName::new(ns, &s.name))
    })
}

fn subjects_to_workloads(tracker: &DependencyTracker, subjects: impl Iterator<Item = NamespacedName>) -> Vec<ObjectRef<Workload>> {
    let mut out: Vec<ObjectRef<Workload>> = subjects.flat_map(|sa| to_refs(tracker.lookup(&service_account_key(&sa.namespace, &sa.name)))).collect();
    out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    out.dedup();
    out
}

pub fn role_binding_to_workloads(tracker: &DependencyTracker, rb: &RoleBinding) -> Vec<ObjectRef<Workload>> {
    let ns = rb.namespace();
    let subjects = rb.subjects.as_deref().unwrap_or_default();
    subjects_to_workloads(tracker, service_accounts(subjects, ns.as_deref()))
}

pub fn cluster_role_binding_to_workloads(tracker: &DependencyTracker, crb: &ClusterRoleBinding) -> Vec<ObjectRef<Workload>> {
    let subjects = crb.subjects.as_deref().unwrap_or_default();
    subjects_to_workloads(tracker, service_accounts(subjects, None))
}

/// Role -> bindings in its namespace that reference it -> their service accounts.
pub fn role_to_workloads(tracker: &DependencyTracker, role: &Role, bindings: &[Arc<RoleBinding>]) -> Vec<ObjectRef<Workload>> {
    let name = role.name_any();
    let ns = role.namespace();
    let subjects: Vec<NamespacedName> = bindings
        .iter()
        .filter(|rb| rb.role_ref.kind == "Role" && rb.role_ref.name == name && rb.namespace() == ns)
        .flat_map(|rb| service_accounts(rb.subjects.as_deref().unwrap_or_default(), ns.as_deref()).collect::<Vec<_>>())
        .collect();
    subjects_to_workloads(tracker, subjects.into_iter())
}

/// ClusterRole -> role and cluster role bindings referencing it -> their service accounts.
pub fn cluster_role_to_workloads(
    tracker: &DependencyTracker,
    role: &ClusterRole,
    bindings: &[Arc<RoleBinding>],
    cluster_bindings: &[Arc<ClusterRoleBinding>],
) -> Vec<ObjectRef<Workload>> {
    let name = role.name_any();
    let mut subjects: Vec<NamespacedName> = bindings
        .iter()
        .filter(|rb| rb.role_ref.kind == "ClusterRole" && rb.role_ref.name == name)
        .flat_map(|rb| {
            let ns = rb.namespace();
            service_accounts(rb.subjects.as_deref().unwrap_or_default(), ns.as_deref()).collect::<Vec<_>>()
        })
        .collect();
    subjects.extend(
        cluster_bindings
            .iter()
            .filter(|crb| crb.role_ref.kind == "ClusterRole" && crb.role_ref.name == name)
            .flat_map(|crb| service_accounts(crb.subjects.as_deref().unwrap_or_default(), None).collect::<Vec<_>>()),
    );
    subjects_to_workloads(tracker, subjects.into_iter())
}
