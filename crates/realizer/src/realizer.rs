//! Walks a supply chain's resource graph in dependency order.

use std::collections::HashSet;

use carto_core::conditions::{reasons, resource_submitted_condition, resource_submitted_failure, READY};
use carto_core::{ClusterSupplyChain, Condition, ConditionManager, OutputDescriptor, ResourceStatus, ResourceStatuses, SupplyChainResource};
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use metrics::counter;
use tracing::{debug, warn};

use crate::resource::{Outputs, ResourceRealizer};
use crate::RealizeError;

#[derive(Debug, Clone, Copy, Default)]
pub struct Realizer;

impl Realizer {
    pub fn new() -> Self {
        Self
    }

    /// Realize every entry of `chain`, recording one status per entry in
    /// `statuses`. Returns the first error in walk order; downstream entries of a
    /// failed entry are skipped.
    pub async fn realize(
        &self,
        rr: &ResourceRealizer,
        chain: &ClusterSupplyChain,
        statuses: &mut ResourceStatuses,
    ) -> Result<(), RealizeError> {
        let now = Utc::now();
        let resources = &chain.spec.resources;
        statuses.begin();

        let order = match topo_order(resources) {
            Ok(order) => order,
            Err(cycle) => {
                let err = RealizeError::Cycle { chain: chain.name_any(), resources: cycle };
                warn!(supply_chain = %chain.name_any(), error = %err, "supply chain is not a DAG");
                for entry in resources {
                    let cond = resource_submitted_failure(reasons::TEMPLATE_INPUTS_ERROR, err.to_string());
                    let status = carried_over(entry, statuses.previous(&entry.name), cond, now);
                    statuses.add(status);
                }
                return Err(err);
            }
        };

        let mut outputs = Outputs::default();
        let mut failed: HashSet<String> = HashSet::new();
        let mut first_err: Option<RealizeError> = None;

        for idx in order {
            let entry = &resources[idx];
            let previous = statuses.previous(&entry.name).cloned();

            if let Some(upstream) = entry.upstream().find(|u| failed.contains(*u)) {
                debug!(resource = %entry.name, upstream = %upstream, "skipping resource with unrealized upstream");
                let cond = resource_submitted_failure(
                    reasons::TEMPLATE_INPUTS_ERROR,
                    format!("upstream resource [{}] was not realized", upstream),
                );
                statuses.add(carried_over(entry, previous.as_ref(), cond, now));
                failed.insert(entry.name.clone());
                continue;
            }

            let outcome = rr.realize_resource(entry, &outputs).await;
            let result = outcome.error.as_ref().map(|e| e.kind()).unwrap_or("Submitted");
            counter!("resource_realize_total", 1u64, "result" => result);
            let stamped_ref = outcome.stamped_ref().or_else(|| previous.as_ref().and_then(|p| p.stamped_ref.clone()));
            let (descriptors, cond) = match &outcome.error {
                None => (carry_transition_times(outcome.descriptors.clone(), previous.as_ref(), now), resource_submitted_condition()),
                Some(err) => (
                    previous.as_ref().map(|p| p.outputs.clone()).unwrap_or_default(),
                    resource_submitted_failure(err.condition_reason(), err.to_string()),
                ),
            };
            statuses.add(ResourceStatus {
                name: entry.name.clone(),
                template_ref: Some(entry.template_ref.clone()),
                stamped_ref,
                inputs: outcome.inputs.clone(),
                outputs: descriptors,
                conditions: resource_conditions(previous.as_ref(), cond, now),
            });

            match outcome.error {
                None => {
                    if let Some(output) = outcome.output {
                        outputs.add(&entry.name, output);
                    }
                }
                Some(err) => {
                    debug!(resource = %entry.name, kind = err.kind(), error = %err, "resource not realized");
                    failed.insert(entry.name.clone());
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Status for an entry that was not (re)stamped this pass.
fn carried_over(entry: &SupplyChainResource, previous: Option<&ResourceStatus>, cond: Condition, now: DateTime<Utc>) -> ResourceStatus {
    ResourceStatus {
        name: entry.name.clone(),
        template_ref: Some(entry.template_ref.clone()),
        stamped_ref: previous.and_then(|p| p.stamped_ref.clone()),
        inputs: previous.map(|p| p.inputs.clone()).unwrap_or_default(),
        outputs: previous.map(|p| p.outputs.clone()).unwrap_or_default(),
        conditions: resource_conditions(previous, cond, now),
    }
}

fn resource_conditions(previous: Option<&ResourceStatus>, cond: Condition, now: DateTime<Utc>) -> Vec<Condition> {
    let seed = previous.map(|p| p.conditions.as_slice()).unwrap_or_default();
    let mut cm = ConditionManager::new(READY, seed);
    cm.add_positive(cond);
    cm.finalize_at(now).0
}

/// Outputs keep their transition time while the digest is unchanged.
fn carry_transition_times(mut descriptors: Vec<OutputDescriptor>, previous: Option<&ResourceStatus>, now: DateTime<Utc>) -> Vec<OutputDescriptor> {
    for d in descriptors.iter_mut() {
        d.last_transition_time = previous
            .and_then(|p| p.outputs.iter().find(|o| o.name == d.name && o.digest == d.digest))
            .and_then(|o| o.last_transition_time)
            .or(Some(now));
    }
    descriptors
}

/// Indices of `resources` in dependency order, ties broken by declaration
/// order. On a cycle, returns the names of the entries that could not be placed.
/// Bindings to unknown entries do not constrain the order.
pub fn topo_order(resources: &[SupplyChainResource]) -> Result<Vec<usize>, Vec<String>> {
    let known: HashSet<&str> = resources.iter().map(|r| r.name.as_str()).collect();
    let mut placed_names: HashSet<&str> = HashSet::with_capacity(resources.len());
    let mut placed = vec![false; resources.len()];
    let mut order = Vec::with_capacity(resources.len());

    while order.len() < resources.len() {
        let next = resources.iter().enumerate().position(|(i, r)| {
            !placed[i] && r.upstream().all(|u| !known.contains(u) || placed_names.contains(u))
        });
        match next {
            Some(i) => {
                placed[i] = true;
                placed_names.insert(resources[i].name.as_str());
                order.push(i);
            }
            None => {
                let stuck = resources.iter().enumerate().filter(|(i, _)| !placed[*i]).map(|(_, r)| r.name.clone()).collect();
                return Err(stuck);
            }
        }
    }
    Ok(order)
}
