//! Carto kubehub: cluster access for the controller.
//!
//! * [`Repository`] is the single seam between reconciliation logic and the API
//!   server; [`KubeRepository`] talks to a live cluster and
//!   [`InMemoryRepository`] backs tests.
//! * [`ClientBuilder`] produces clients scoped to a workload's service account.
//! * [`StampedTracker`] installs one watch per stamped GVK and maps events back to
//!   owning workloads.

#![forbid(unsafe_code)]

mod cache;
mod client;
mod cluster;
mod error;
pub mod memory;
mod repository;
mod scheme;
mod tracker;

pub use cache::{body_hash, SubmissionCache};
pub use client::ClientBuilder;
pub use cluster::KubeRepository;
pub use error::RepoError;
pub use memory::InMemoryRepository;
pub use repository::{has_token, set_owner_reference, Repository, FIELD_MANAGER};
pub use scheme::Scheme;
pub use tracker::{workload_owners, InformerTracker, StampedTracker, WorkloadRequests};
