use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("kind {0} is not registered in the scheme")]
    UnknownKind(String),
    #[error("invalid object: {0}")]
    InvalidObject(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RepoError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound { kind: kind.into(), name: name.into() }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// The API server answered and refused the request (4xx), as opposed to a
    /// transport or server-side failure.
    pub fn is_rejected(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(resp)) => (400..500).contains(&resp.code),
            Self::InvalidObject(_) => true,
            _ => false,
        }
    }
}
