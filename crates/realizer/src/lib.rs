//! Carto realizer: stamps a supply chain's resources for one workload.
//!
//! [`ResourceRealizer`] handles a single entry (template lookup, inputs,
//! parameters, stamping, submission, outputs); [`Realizer`] orders the entries
//! by their input bindings and records a status per entry.

#![forbid(unsafe_code)]

mod error;
mod realizer;
mod resource;

pub use error::{add_condition_for_resource_submitted, RealizeError};
pub use realizer::{topo_order, Realizer};
pub use resource::{
    Outputs, RepositoryRealizerBuilder, ResourceOutcome, ResourceRealizer, ResourceRealizerBuilder, ScopedRealizerBuilder,
};
