//! Carto controller: reconciles workloads against cluster supply chains.

#![forbid(unsafe_code)]

mod controller;
mod error;
pub mod mappers;
mod reconciler;

pub use controller::{run, Components, ControllerConfig};
pub use error::ReconcileError;
pub use reconciler::{resolve_service_account, service_account_key, template_key, WorkloadReconciler};
