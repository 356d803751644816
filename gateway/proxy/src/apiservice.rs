//! Restricts the APIService listener to discovery requests.

use crate::{BoxError, Response};
use futures::future;
use http::{Method, Request};
use std::task::{Context, Poll};
use vcluster_gateway_k8s_api::StatusError;

/// Answers every non-discovery request with 403 and hands the rest to the
/// inner service.
#[derive(Clone, Debug)]
pub struct AllowList<S> {
    inner: S,
}

// === impl AllowList ===

impl<S> AllowList<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn layer() -> impl tower::Layer<S, Service = Self> + Clone {
        tower::layer::layer_fn(Self::new)
    }
}

impl<S, B> tower::Service<Request<B>> for AllowList<S>
where
    S: tower::Service<Request<B>, Response = Response>,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = BoxError;
    type Future = future::BoxFuture<'static, Result<Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), BoxError>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        if req.method() != Method::GET || !is_allowed(req.uri().path()) {
            tracing::debug!(method = %req.method(), path = %req.uri().path(), "Denying non-discovery request");
            let rsp = StatusError::forbidden(format!(
                "{} {} is not a discovery request",
                req.method(),
                req.uri().path()
            ))
            .to_response()
            .map(crate::full);
            return Box::pin(future::ok(rsp));
        }
        let call = self.inner.call(req);
        Box::pin(async move { call.await.map_err(Into::into) })
    }
}

/// Whether `path` is one of the discovery endpoints.
pub fn is_allowed(path: &str) -> bool {
    let path = path.trim_matches('/');
    if path.is_empty() || path == "version" {
        return true;
    }
    if [".well-known", "readyz", "livez", "openapi"]
        .iter()
        .any(|prefix| path.starts_with(prefix))
    {
        return true;
    }

    let segments = path.split('/').collect::<Vec<_>>();
    match segments[0] {
        "api" => segments.len() <= 2,
        "apis" => segments.len() <= 3,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::full;
    use http::StatusCode;
    use rstest::rstest;
    use std::convert::Infallible;
    use tower::ServiceExt;

    #[rstest]
    #[case::root("/", true)]
    #[case::empty("", true)]
    #[case::version("/version", true)]
    #[case::core("/api", true)]
    #[case::core_version("/api/v1", true)]
    #[case::core_resource("/api/v1/pods", false)]
    #[case::groups("/apis", true)]
    #[case::group("/apis/metrics.k8s.io", true)]
    #[case::group_version("/apis/metrics.k8s.io/v1beta1", true)]
    #[case::group_resource("/apis/metrics.k8s.io/v1beta1/pods", false)]
    #[case::openapi("/openapi/v3/apis/metrics.k8s.io/v1beta1", true)]
    #[case::well_known("/.well-known/openid-configuration", true)]
    #[case::readyz("/readyz/ping", true)]
    #[case::livez("/livez", true)]
    #[case::healthz("/healthz", false)]
    #[case::metrics("/metrics", false)]
    fn discovery_paths(#[case] path: &str, #[case] allowed: bool) {
        assert_eq!(is_allowed(path), allowed, "{path}");
    }

    async fn status(method: Method, path: &str) -> StatusCode {
        let svc = AllowList::new(tower::service_fn(|_: Request<()>| async {
            Ok::<_, Infallible>(http::Response::new(full("ok")))
        }));
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(())
            .unwrap();
        svc.oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn denies_writes_and_resources() {
        assert_eq!(status(Method::GET, "/apis").await, StatusCode::OK);
        assert_eq!(status(Method::POST, "/apis").await, StatusCode::FORBIDDEN);
        assert_eq!(
            status(Method::GET, "/api/v1/namespaces/default/secrets").await,
            StatusCode::FORBIDDEN
        );
    }
}
