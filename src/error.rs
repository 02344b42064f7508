use crate::api::TypeKey;

/// Errors surfaced by reconcilers and validators.
///
/// Store failures are retried by the work queue with backoff; everything else
/// is recorded as a condition on the affected record and left for the user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("resource {type_key} is not served by the cluster: {reason}")]
    UnknownResource { type_key: TypeKey, reason: String },

    #[error("admission review is missing its request")]
    MissingAdmissionRequest,

    #[error("authorization check failed: {0}")]
    Authorization(#[source] kube::Error),
}

impl Error {
    /// True when the failure came from the store and a retry can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::Authorization(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
