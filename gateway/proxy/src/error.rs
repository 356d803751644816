use crate::{full, Response};
use tracing::warn;
use vcluster_gateway_k8s_api::StatusError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A condition that maps directly onto an API status.
    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("request to the upstream API server failed: {0}")]
    Upstream(#[from] kube::Error),

    #[error("failed to delegate an authorization decision: {0}")]
    Delegation(#[source] anyhow::Error),

    #[error("failed to read request body: {0}")]
    Body(#[source] crate::BoxError),

    #[error("failed to read upstream response body: {0}")]
    UpstreamBody(#[source] crate::BoxError),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}

// === impl Error ===

impl Error {
    /// The API status this error is reported to the client as. Errors the
    /// upstream API server returned keep their status; transport failures are
    /// internal errors.
    pub fn status(&self) -> StatusError {
        match self {
            Self::Status(status) => status.clone(),
            Self::Upstream(error) => StatusError::from_kube(error),
            Self::Delegation(_) => StatusError::internal(self.to_string()),
            Self::Body(error) => StatusError::bad_request(error.to_string()),
            Self::UpstreamBody(_) => StatusError::internal(self.to_string()),
            Self::Encode(error) => StatusError::internal(error.to_string()),
        }
    }

    pub fn into_response(self) -> Response {
        let status = self.status();
        if status.code >= 500 {
            warn!(error = %self, "Request failed");
        }
        status.to_response().map(full)
    }
}
