use carto_kubehub::RepoError;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Cluster API failure; retried with backoff.
    #[error("transient error: {0}")]
    Transient(#[from] RepoError),
    /// Violated system invariant; retried and logged at error level.
    #[error("unhandled error: {0}")]
    Unhandled(#[source] BoxError),
}

impl ReconcileError {
    pub fn unhandled(err: impl Into<BoxError>) -> Self {
        Self::Unhandled(err.into())
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, Self::Unhandled(_))
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Unhandled(_) => "unhandled",
        }
    }
}
