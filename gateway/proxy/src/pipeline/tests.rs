use super::*;
use crate::{Credentials, Outcome};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use vcluster_gateway_core::{Authenticated, RequestInfo, Source, UserInfo};
use vcluster_gateway_k8s_api::{
    Reviewer, SubjectAccessReviewSpec, SubjectAccessReviewStatus, TokenReviewStatus,
};

/// An upstream that echoes the request line and credential headers.
fn echo() -> kube::Client {
    let svc = tower::service_fn(|req: http::Request<kube::client::Body>| async move {
        let header = |name: &str| {
            req.headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(",")
        };
        let body = serde_json::json!({
            "uri": req.uri().to_string(),
            "authorization": header("authorization"),
            "user": header("impersonate-user"),
            "groups": header("impersonate-group"),
        });
        Ok::<_, std::convert::Infallible>(http::Response::new(Full::new(Bytes::from(
            body.to_string(),
        ))))
    });
    kube::Client::new(svc, "default")
}

fn pipeline() -> Pipeline {
    Pipeline::new(
        Upstream::new(echo(), Credentials::Passthrough),
        Upstream::new(echo(), Credentials::Impersonate),
    )
}

fn request(path: &str, user: Authenticated) -> ProxyRequest {
    let parts = http::Request::builder()
        .method(Method::GET)
        .uri(path)
        .header("authorization", "Bearer caller")
        .header("impersonate-user", "mallory")
        .body(())
        .unwrap()
        .into_parts()
        .0;
    let info = RequestInfo::parse(&Method::GET, parts.uri.path(), parts.uri.query());
    ProxyRequest {
        parts,
        body: Bytes::new(),
        cx: RequestContext {
            info,
            user,
            impersonated: false,
            node: None,
            needs_rbac: true,
        },
        upgrade: None,
    }
}

fn host_user(name: &str) -> Authenticated {
    Authenticated {
        user: UserInfo {
            name: name.to_string(),
            groups: vec!["ops".to_string(), "system:authenticated".to_string()],
            ..UserInfo::default()
        },
        source: Source::Host,
    }
}

async fn json(rsp: Response) -> serde_json::Value {
    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

struct Respond(&'static str, &'static str);

#[async_trait::async_trait]
impl Filter for Respond {
    fn name(&self) -> &'static str {
        self.0
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        cx.info.is_resource(self.1)
    }

    async fn handle(&self, _: ProxyRequest) -> Result<Outcome, Error> {
        Ok(Outcome::Respond(http::Response::new(crate::full(self.0))))
    }
}

/// Moves every pod request to a fixed namespace and hands it on.
struct Rewrite;

#[async_trait::async_trait]
impl Filter for Rewrite {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        cx.info.is_resource("pods")
    }

    fn enforces_rbac(&self) -> bool {
        false
    }

    async fn handle(&self, mut req: ProxyRequest) -> Result<Outcome, Error> {
        let path = req.cx.info.path_for("rewritten", &req.cx.info.name);
        req.set_path(&path).map_err(|e| StatusError::bad_request(e.to_string()))?;
        Ok(Outcome::Continue(req))
    }
}

#[derive(Default)]
struct Rbac {
    allow: bool,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Reviewer for Rbac {
    async fn token_review(&self, _: &str) -> kube::Result<TokenReviewStatus> {
        unimplemented!()
    }

    async fn subject_access_review(
        &self,
        _: SubjectAccessReviewSpec,
    ) -> kube::Result<SubjectAccessReviewStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SubjectAccessReviewStatus {
            allowed: self.allow,
            ..SubjectAccessReviewStatus::default()
        })
    }
}

#[tokio::test]
async fn first_matching_filter_responds() {
    let pipeline = pipeline()
        .with_filter(Respond("services", "services"))
        .with_filter(Respond("services-again", "services"));

    let (handler, rsp) = pipeline
        .dispatch(request("/api/v1/namespaces/ns/services", Authenticated::anonymous()))
        .await;
    assert_eq!(handler, "services");
    let body = rsp.unwrap().into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"services"));
}

#[tokio::test]
async fn virtual_identities_pass_through() {
    let (handler, rsp) = pipeline()
        .dispatch(request("/api/v1/namespaces/ns/configmaps?limit=1", Authenticated::anonymous()))
        .await;
    assert_eq!(handler, VIRTUAL);
    let echoed = json(rsp.unwrap()).await;
    assert_eq!(echoed["uri"], "/api/v1/namespaces/ns/configmaps?limit=1");
    assert_eq!(echoed["authorization"], "Bearer caller");
    assert_eq!(echoed["user"], "mallory");
}

#[tokio::test]
async fn host_identities_are_impersonated() {
    let (_, rsp) = pipeline()
        .dispatch(request("/api/v1/namespaces/ns/configmaps", host_user("admin")))
        .await;
    let echoed = json(rsp.unwrap()).await;
    assert_eq!(echoed["authorization"], "");
    assert_eq!(echoed["user"], "admin");
    assert_eq!(echoed["groups"], "ops,system:authenticated");
}

#[tokio::test]
async fn rewritten_requests_continue() {
    let pipeline = pipeline().with_filter(Rewrite);
    let (handler, rsp) = pipeline
        .dispatch(request("/api/v1/namespaces/ns/pods/web", Authenticated::anonymous()))
        .await;
    assert_eq!(handler, VIRTUAL);
    assert_eq!(
        json(rsp.unwrap()).await["uri"],
        "/api/v1/namespaces/rewritten/pods/web"
    );
}

#[tokio::test]
async fn virtual_rbac_gates_handled_requests() {
    let rbac = Arc::new(Rbac::default());
    let pipeline = pipeline()
        .with_rbac(VirtualRbac::new(rbac.clone()))
        .with_filter(Rewrite)
        .with_filter(Respond("services", "services"));

    let (handler, rsp) = pipeline
        .dispatch(request("/api/v1/namespaces/ns/services", host_user("alice")))
        .await;
    assert_eq!(handler, "services");
    let status = rsp.unwrap_err().status();
    assert_eq!(status.code, StatusCode::FORBIDDEN.as_u16());
    assert!(status.message.starts_with(r#"User "alice" cannot get resource "services""#));

    // Filters that do not enforce RBAC, and the virtual API server itself,
    // are not gated by the gateway.
    let (handler, rsp) = pipeline
        .dispatch(request("/api/v1/namespaces/ns/pods", host_user("alice")))
        .await;
    assert_eq!(handler, VIRTUAL);
    assert!(rsp.is_ok());
    assert_eq!(rbac.calls.load(Ordering::SeqCst), 1);

    // An explicit grant from the authorization chain skips the check.
    let mut req = request("/api/v1/namespaces/ns/services", host_user("alice"));
    req.cx.needs_rbac = false;
    let (_, rsp) = pipeline.dispatch(req).await;
    assert!(rsp.is_ok());
    assert_eq!(rbac.calls.load(Ordering::SeqCst), 1);
}
