//! Kubernetes `Status` errors.
//!
//! Every failure the gateway answers with is rendered as a `Status` object so
//! that API clients can decode it the same way as an API server error.

use bytes::Bytes;
use http::{header, Response, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusDetails};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    AlreadyExists,
    Conflict,
    UnsupportedMediaType,
    Invalid,
    InternalError,
    ServiceUnavailable,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct StatusError {
    pub code: u16,
    pub reason: String,
    pub message: String,
    pub details: Option<StatusDetails>,
}

// === impl Reason ===

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "NotFound",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::AlreadyExists => "AlreadyExists",
            Self::Conflict => "Conflict",
            Self::UnsupportedMediaType => "UnsupportedMediaType",
            Self::Invalid => "Invalid",
            Self::InternalError => "InternalError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::Timeout => "Timeout",
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::AlreadyExists | Self::Conflict => 409,
            Self::UnsupportedMediaType => 415,
            Self::Invalid => 422,
            Self::InternalError => 500,
            Self::ServiceUnavailable => 503,
            Self::Timeout => 504,
        }
    }
}

// === impl StatusError ===

impl StatusError {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            code: reason.code(),
            reason: reason.as_str().to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Reason::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Reason::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Reason::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Reason::InternalError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Reason::Timeout, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Reason::Conflict, message)
    }

    pub fn not_found(group: &str, resource: &str, name: &str) -> Self {
        let qualified = if group.is_empty() {
            resource.to_string()
        } else {
            format!("{resource}.{group}")
        };
        let mut err = Self::new(
            Reason::NotFound,
            format!("{qualified} {name:?} not found"),
        );
        err.details = Some(StatusDetails {
            group: Some(group.to_string()).filter(|g| !g.is_empty()),
            kind: Some(resource.to_string()),
            name: Some(name.to_string()),
            ..StatusDetails::default()
        });
        err
    }

    pub fn is(&self, reason: Reason) -> bool {
        self.reason == reason.as_str()
    }

    /// Preserves the status the API server reported; anything that did not
    /// come back as an API error is an internal error.
    pub fn from_kube(error: &kube::Error) -> Self {
        match error {
            kube::Error::Api(rsp) => Self {
                code: rsp.code,
                reason: rsp.reason.clone(),
                message: rsp.message.clone(),
                details: None,
            },
            error => Self::internal(error.to_string()),
        }
    }

    pub fn to_status(&self) -> Status {
        Status {
            code: Some(self.code.into()),
            details: self.details.clone(),
            message: Some(self.message.clone()),
            reason: Some(self.reason.clone()),
            status: Some("Failure".to_string()),
            ..Status::default()
        }
    }

    pub fn to_response(&self) -> Response<Bytes> {
        // `Status` always serializes.
        let body = serde_json::to_vec(&self.to_status()).unwrap_or_default();
        let code =
            StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut rsp = Response::new(Bytes::from(body));
        *rsp.status_mut() = code;
        rsp.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        rsp
    }
}

impl From<kube::Error> for StatusError {
    fn from(error: kube::Error) -> Self {
        Self::from_kube(&error)
    }
}

/// Whether a client error reports the given reason.
pub fn is_reason(error: &kube::Error, reason: Reason) -> bool {
    matches!(error, kube::Error::Api(rsp) if rsp.reason == reason.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_status_objects() {
        let rsp = StatusError::not_found("", "services", "foo").to_response();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);

        let status: serde_json::Value = serde_json::from_slice(rsp.body()).unwrap();
        assert_eq!(status["kind"], "Status");
        assert_eq!(status["apiVersion"], "v1");
        assert_eq!(status["status"], "Failure");
        assert_eq!(status["reason"], "NotFound");
        assert_eq!(status["code"], 404);
        assert_eq!(status["message"], r#"services "foo" not found"#);
        assert_eq!(status["details"]["name"], "foo");
    }

    #[test]
    fn preserves_api_errors() {
        let error = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "nodes \"n1\" is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        let status = StatusError::from_kube(&error);
        assert_eq!(status.code, 403);
        assert!(status.is(Reason::Forbidden));
        assert!(is_reason(&error, Reason::Forbidden));
        assert!(!is_reason(&error, Reason::NotFound));
    }
}
