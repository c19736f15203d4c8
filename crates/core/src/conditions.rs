//! Status conditions and the per-reconciliation condition manager.
//!
//! A [`ConditionManager`] is seeded with the conditions currently on an object,
//! collects the conditions observed during one reconciliation and finalizes them
//! into a canonical list with a derived owner condition (`Ready`).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------- Condition types ----------------
pub const READY: &str = "Ready";
pub const SUPPLY_CHAIN_READY: &str = "SupplyChainReady";
pub const RESOURCES_SUBMITTED: &str = "ResourcesSubmitted";
/// Per-resource submission condition (kept on `status.resources[].conditions`).
pub const RESOURCE_SUBMITTED: &str = "ResourceSubmitted";

// ---------------- Reasons ----------------
pub mod reasons {
    pub const READY: &str = "Ready";
    pub const SUPPLY_CHAIN_READY: &str = "SupplyChainReady";
    pub const RESOURCES_SUBMITTED: &str = "ResourcesSubmitted";
    pub const MISSING_READY_IN_SUPPLY_CHAIN: &str = "MissingReadyInSupplyChain";
    pub const SUPPLY_CHAIN_NOT_FOUND: &str = "SupplyChainNotFound";
    pub const TOO_MANY_SUPPLY_CHAIN_MATCHES: &str = "TooManySupplyChainMatches";
    pub const WORKLOAD_MISSING_LABELS: &str = "WorkloadMissingLabels";
    pub const SERVICE_ACCOUNT_SECRET_NOT_FOUND: &str = "ServiceAccountSecretNotFound";
    pub const RESOURCE_REALIZER_BUILDER_ERROR: &str = "ResourceRealizerBuilderError";
    pub const TEMPLATE_OBJECT_RETRIEVAL_FAILURE: &str = "TemplateObjectRetrievalFailure";
    pub const STAMP_ERROR: &str = "StampError";
    pub const APPLY_STAMPED_OBJECT_ERROR: &str = "ApplyStampedObjectError";
    pub const TEMPLATE_STAMP_FAILURE: &str = "TemplateStampFailure";
    pub const JSON_PATH_ERROR: &str = "JsonPathError";
    pub const TEMPLATE_INPUTS_ERROR: &str = "TemplateInputsError";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus, reason: &str) -> Self {
        Self { type_: type_.to_string(), status, reason: reason.to_string(), message: None, last_transition_time: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Equality on everything but the transition time.
    fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_ && self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

// ---------------- Workload conditions ----------------

pub fn supply_chain_ready_condition() -> Condition {
    Condition::new(SUPPLY_CHAIN_READY, ConditionStatus::True, reasons::READY)
}

/// Carries the chain's own `Ready` condition over into the message.
pub fn missing_ready_in_supply_chain_condition(chain_ready: Option<&Condition>) -> Condition {
    let message = match chain_ready {
        Some(c) => format!(
            "supply chain is not in ready state: [{}] {}",
            c.reason,
            c.message.as_deref().unwrap_or_default()
        ),
        None => "supply chain does not have a ready condition".to_string(),
    };
    let status = match chain_ready.map(|c| c.status) {
        Some(ConditionStatus::Unknown) => ConditionStatus::Unknown,
        _ => ConditionStatus::False,
    };
    Condition::new(SUPPLY_CHAIN_READY, status, reasons::MISSING_READY_IN_SUPPLY_CHAIN).with_message(message)
}

pub fn supply_chain_not_found_condition<'a>(labels: impl IntoIterator<Item = (&'a String, &'a String)>) -> Condition {
    let rendered: Vec<String> = labels.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    Condition::new(SUPPLY_CHAIN_READY, ConditionStatus::False, reasons::SUPPLY_CHAIN_NOT_FOUND).with_message(format!(
        "no supply chain found where full selector is satisfied by labels: [{}]",
        rendered.join(", ")
    ))
}

/// `names` must already be sorted.
pub fn too_many_supply_chain_matches_condition(names: &[String]) -> Condition {
    Condition::new(SUPPLY_CHAIN_READY, ConditionStatus::False, reasons::TOO_MANY_SUPPLY_CHAIN_MATCHES)
        .with_message(format!("more than one supply chain selected for workload: [{}]", names.join(", ")))
}

pub fn workload_missing_labels_condition() -> Condition {
    Condition::new(SUPPLY_CHAIN_READY, ConditionStatus::False, reasons::WORKLOAD_MISSING_LABELS)
        .with_message("workload is missing required labels")
}

pub fn resources_submitted_condition() -> Condition {
    Condition::new(RESOURCES_SUBMITTED, ConditionStatus::True, reasons::RESOURCES_SUBMITTED)
}

pub fn service_account_secret_not_found_condition(err: &dyn std::fmt::Display) -> Condition {
    Condition::new(RESOURCES_SUBMITTED, ConditionStatus::False, reasons::SERVICE_ACCOUNT_SECRET_NOT_FOUND)
        .with_message(err.to_string())
}

pub fn resource_realizer_builder_error_condition(err: &dyn std::fmt::Display) -> Condition {
    Condition::new(RESOURCES_SUBMITTED, ConditionStatus::False, reasons::RESOURCE_REALIZER_BUILDER_ERROR)
        .with_message(err.to_string())
}

/// Failed submission with a realizer-specific reason.
pub fn resources_submitted_failure(reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(RESOURCES_SUBMITTED, ConditionStatus::False, reason).with_message(message)
}

// ---------------- Resource conditions ----------------

pub fn resource_submitted_condition() -> Condition {
    Condition::new(RESOURCE_SUBMITTED, ConditionStatus::True, reasons::RESOURCES_SUBMITTED)
}

pub fn resource_submitted_failure(reason: &str, message: impl Into<String>) -> Condition {
    Condition::new(RESOURCE_SUBMITTED, ConditionStatus::False, reason).with_message(message)
}

// ---------------- Manager ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    /// Healthy when `True`.
    Positive,
    /// Healthy when `False`.
    Negative,
}

#[derive(Debug, Clone)]
pub struct ConditionManager {
    owner_type: String,
    seed: Vec<Condition>,
    entries: Vec<(Condition, Polarity)>,
}

impl ConditionManager {
    pub fn new(owner_type: &str, seed: &[Condition]) -> Self {
        Self { owner_type: owner_type.to_string(), seed: seed.to_vec(), entries: Vec::new() }
    }

    pub fn add_positive(&mut self, condition: Condition) {
        self.add(condition, Polarity::Positive);
    }

    pub fn add_negative(&mut self, condition: Condition) {
        self.add(condition, Polarity::Negative);
    }

    // A later add for a type replaces the earlier one in place.
    fn add(&mut self, condition: Condition, polarity: Polarity) {
        if let Some(slot) = self.entries.iter_mut().find(|(c, _)| c.type_ == condition.type_) {
            *slot = (condition, polarity);
        } else {
            self.entries.push((condition, polarity));
        }
    }

    /// True when any non-owner condition is unhealthy.
    pub fn has_failures(&self) -> bool {
        self.entries.iter().any(|(c, p)| !healthy(c, *p))
    }

    pub fn finalize(&self) -> (Vec<Condition>, bool) {
        self.finalize_at(Utc::now())
    }

    /// Finalize using `now` for every transition that happened in this pass.
    pub fn finalize_at(&self, now: DateTime<Utc>) -> (Vec<Condition>, bool) {
        let owner = match self.entries.iter().find(|(c, p)| !healthy(c, *p)) {
            None => Condition::new(&self.owner_type, ConditionStatus::True, reasons::READY),
            Some((c, _)) => {
                let status = if c.status == ConditionStatus::Unknown { ConditionStatus::Unknown } else { ConditionStatus::False };
                Condition { type_: self.owner_type.clone(), status, reason: c.reason.clone(), message: c.message.clone(), last_transition_time: None }
            }
        };

        let mut rest: Vec<Condition> = self
            .entries
            .iter()
            .filter(|(c, _)| c.type_ != self.owner_type)
            .map(|(c, _)| c.clone())
            .collect();
        rest.sort_by(|a, b| a.type_.cmp(&b.type_));

        let seed: HashMap<&str, &Condition> = self.seed.iter().map(|c| (c.type_.as_str(), c)).collect();
        let mut out = Vec::with_capacity(rest.len() + 1);
        for mut c in std::iter::once(owner).chain(rest) {
            c.last_transition_time = match seed.get(c.type_.as_str()) {
                Some(prev) if prev.status == c.status && prev.last_transition_time.is_some() => prev.last_transition_time,
                _ => Some(now),
            };
            out.push(c);
        }

        let changed = out.len() != self.seed.len()
            || out.iter().any(|c| seed.get(c.type_.as_str()).map(|prev| !prev.same_state(c)).unwrap_or(true));
        (out, changed)
    }
}

fn healthy(c: &Condition, polarity: Polarity) -> bool {
    match polarity {
        Polarity::Positive => c.status == ConditionStatus::True,
        Polarity::Negative => c.status == ConditionStatus::False,
    }
}
