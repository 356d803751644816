use crate::{
    impersonate,
    metrics::{AuthnResult, GatewayMetrics},
    BoxError, Error, NodeResolver, PeerCertificate, Pipeline, ProxyRequest, RequestContext,
    Response, MAX_BODY_SIZE,
};
use bytes::Bytes;
use futures::future;
use http::header;
use http_body_util::{BodyExt, Limited};
use std::{convert::Infallible, sync::Arc};
use tokio::time;
use tracing::{debug, info_span, Instrument};
use vcluster_gateway_auth::{self as auth, authz::Union, bearer_token, Authenticators};
use vcluster_gateway_core::{Attributes, Authenticated, RequestInfo};
use vcluster_gateway_k8s_api::StatusError;

/// Name reported for requests the gateway rejects before routing.
const GATEWAY: &str = "gateway";

/// Authenticates, authorizes and routes API requests.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    authn: Authenticators,
    authz: Union,
    nodes: Arc<dyn NodeResolver>,
    pipeline: Pipeline,
    metrics: GatewayMetrics,
}

// === impl Gateway ===

impl Gateway {
    pub fn new(
        authn: Authenticators,
        authz: Union,
        nodes: Arc<dyn NodeResolver>,
        pipeline: Pipeline,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                authn,
                authz,
                nodes,
                pipeline,
                metrics,
            }),
        }
    }

    async fn handle<B>(self, req: http::Request<B>) -> Response
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let start = time::Instant::now();
        let (handler, rsp) = match self.admit(req).await {
            Ok(req) => self.inner.pipeline.dispatch(req).await,
            Err(error) => (GATEWAY, Err(error)),
        };
        let rsp = rsp.unwrap_or_else(Error::into_response);
        self.inner.metrics.handled(handler, rsp.status(), start);
        rsp
    }

    /// Resolves who is asking and whether the gateway lets them.
    async fn admit<B>(&self, mut req: http::Request<B>) -> Result<ProxyRequest, Error>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let upgrade = req
            .headers()
            .contains_key(header::UPGRADE)
            .then(|| hyper::upgrade::on(&mut req));
        let peer = req.extensions().get::<PeerCertificate>().cloned();

        let (parts, body) = req.into_parts();
        let info = RequestInfo::parse(&parts.method, parts.uri.path(), parts.uri.query());
        let node = host(&parts).and_then(|host| self.inner.nodes.resolve(host));

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token);
        let user = self
            .authenticate(token, peer.as_ref().map(|p| p.0.as_ref()))
            .await?;

        let (user, impersonated) =
            if !user.is_virtual_native() && impersonate::requested(&parts.headers) {
                (self.impersonate(user, &parts.headers).await?, true)
            } else {
                (user, false)
            };

        let attrs = Attributes::new(user.user.clone(), &info, node.clone());
        let decided = self
            .inner
            .authz
            .decide(&attrs)
            .await
            .map_err(Error::Delegation)?;
        if !decided.verdict.is_allowed() {
            debug!(authorizer = decided.authorizer, reason = %decided.verdict.reason, "Forbidden");
            return Err(forbidden(&attrs, &decided.verdict.reason).into());
        }

        // Only admitted requests are buffered.
        let body = Limited::new(body, MAX_BODY_SIZE)
            .collect()
            .await
            .map_err(Error::Body)?
            .to_bytes();

        Ok(ProxyRequest {
            cx: RequestContext {
                info,
                user,
                impersonated,
                node,
                needs_rbac: decided.by_fallback(),
            },
            parts,
            body,
            upgrade,
        })
    }

    async fn authenticate(
        &self,
        token: Option<&str>,
        peer: Option<&[u8]>,
    ) -> Result<Authenticated, Error> {
        match self.inner.authn.authenticate(token, peer).await {
            Ok(user) => {
                self.inner.metrics.authenticated(user.source.into());
                Ok(user)
            }
            Err(auth::Error::Delegation(error)) => {
                self.inner.metrics.authenticated(AuthnResult::Error);
                Err(Error::Delegation(error))
            }
            Err(auth::Error::Rejected(reason)) => {
                self.inner.metrics.authenticated(AuthnResult::Rejected);
                debug!(%reason, "Unauthorized");
                Err(StatusError::unauthorized(reason).into())
            }
            Err(error) => {
                self.inner.metrics.authenticated(AuthnResult::Rejected);
                debug!(%error, "Unauthorized");
                Err(StatusError::unauthorized("Unauthorized").into())
            }
        }
    }

    /// Every requested attribute must be explicitly granted; the chain's
    /// fallback never grants impersonation.
    async fn impersonate(
        &self,
        requester: Authenticated,
        headers: &http::HeaderMap,
    ) -> Result<Authenticated, Error> {
        let target = impersonate::parse(headers)?;
        for attrs in impersonate::checks(&requester.user, &target) {
            let decided = self
                .inner
                .authz
                .decide(&attrs)
                .await
                .map_err(Error::Delegation)?;
            if !decided.verdict.is_allowed() || decided.by_fallback() {
                return Err(forbidden(&attrs, &decided.verdict.reason).into());
            }
        }
        debug!(requester = %requester.user.name, user = %target.name, "Impersonating");
        Ok(Authenticated {
            user: impersonate::effective(target),
            source: requester.source,
        })
    }
}

impl<B> tower::Service<http::Request<B>> for Gateway
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let span = info_span!("request", method = %req.method(), path = %req.uri().path());
        let gateway = self.clone();
        Box::pin(async move { Ok(gateway.handle(req).await) }.instrument(span))
    }
}

fn host(parts: &http::request::Parts) -> Option<&str> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
}

fn forbidden(attrs: &Attributes, reason: &str) -> StatusError {
    if reason.is_empty() {
        return StatusError::forbidden(attrs.to_string());
    }
    StatusError::forbidden(format!("{attrs}: {reason}"))
}
