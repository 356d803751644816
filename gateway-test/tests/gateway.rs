use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::Full;
use pretty_assertions::assert_eq;
use prometheus_client::registry::Registry;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use vcluster_gateway_auth::{
    authz::{
        DelegatingAuthorizer, HostCheck, ImpersonationAuthorizer, KubeletAuthorizer, Union,
        VirtualRbac,
    },
    Authenticators, DelegatingAuthenticator,
};
use vcluster_gateway_k8s_api::{ObjectMeta, Pod, StatusError};
use vcluster_gateway_proxy::{
    filters::ServiceWrite, metrics::GatewayMetrics, nodes::NoNodes, Credentials, Gateway,
    Pipeline, Upstream, MAX_BODY_SIZE,
};
use vcluster_gateway_test::{
    init_tracing, read_json, translator, Clusters, FakeApiServer, Recorded,
};

const HOST_TOKEN: &str = "host-token";
const VIRTUAL_TOKEN: &str = "virtual-token";

/// Authenticates `token` as `user` and rejects every other token.
fn issue_token(server: &FakeApiServer, token: &'static str, user: &'static str) {
    server.react("create", "tokenreviews", move |req| {
        let mut review = body(req)?;
        let status = if review["spec"]["token"] == token {
            json!({"authenticated": true, "user": {"username": user, "groups": ["system:authenticated"]}})
        } else {
            json!({"authenticated": false, "error": "invalid bearer token"})
        };
        review["status"] = status;
        Some(Ok(review))
    });
}

/// Answers access reviews with `allowed(spec)`.
fn review_access(server: &FakeApiServer, allowed: impl Fn(&Value) -> bool + Send + Sync + 'static) {
    server.react("create", "subjectaccessreviews", move |req| {
        let mut review = body(req)?;
        review["status"] = json!({"allowed": allowed(&review["spec"])});
        Some(Ok(review))
    });
}

fn body(req: &Recorded) -> Option<Value> {
    serde_json::from_slice(&req.body).ok()
}

fn gateway(clusters: &Clusters) -> Gateway {
    let host = clusters.host.client();
    let virt = clusters.virt.client();

    let authn = Authenticators::new(Arc::new(DelegatingAuthenticator::new(Arc::new(host.clone()))))
        .with_virtual(Arc::new(DelegatingAuthenticator::new(Arc::new(virt.clone()))));
    let check = || HostCheck::new(Arc::new(host.clone()));
    let authz = Union::standard(
        KubeletAuthorizer::new(check()),
        DelegatingAuthorizer::new(Vec::new(), check()),
        ImpersonationAuthorizer::new(check()),
    );
    let pipeline = Pipeline::new(
        Upstream::new(virt.clone(), Credentials::Passthrough),
        Upstream::new(virt.clone(), Credentials::Impersonate),
    )
    .with_filter(ServiceWrite::new(host, virt.clone(), translator()))
    .with_rbac(VirtualRbac::new(Arc::new(virt)));

    let metrics = GatewayMetrics::register(&mut Registry::default());
    Gateway::new(authn, authz, Arc::new(NoNodes), pipeline, metrics)
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Bytes) -> http::Request<Full<Bytes>> {
    let mut builder = http::Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(body))
        .expect("request must be valid")
}

fn clusters() -> Clusters {
    let clusters = Clusters::new();
    issue_token(&clusters.host, HOST_TOKEN, "alice");
    issue_token(&clusters.virt, VIRTUAL_TOKEN, "bob");
    clusters.virt.insert(&Pod {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            ..ObjectMeta::default()
        },
        ..Pod::default()
    });
    clusters
}

fn header_value<'r>(req: &'r Recorded, name: &str) -> Option<&'r str> {
    req.headers.get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test(flavor = "current_thread")]
async fn host_users_are_impersonated() {
    let _tracing = init_tracing();
    let clusters = clusters();

    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::GET,
            "/api/v1/namespaces/default/pods",
            Some(HOST_TOKEN),
            Bytes::new(),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::OK);

    let sent = clusters.virt.requests_for("list", "pods");
    assert_eq!(sent.len(), 1);
    assert_eq!(header_value(&sent[0], "impersonate-user"), Some("alice"));
    assert_eq!(header_value(&sent[0], "authorization"), None);
}

#[tokio::test(flavor = "current_thread")]
async fn virtual_users_keep_their_credentials() {
    let clusters = clusters();

    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::GET,
            "/api/v1/namespaces/default/pods/web",
            Some(VIRTUAL_TOKEN),
            Bytes::new(),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::OK);
    let pod = read_json(rsp).await;
    assert_eq!(pod["metadata"]["name"], "web");

    let sent = clusters.virt.requests_for("get", "pods");
    assert_eq!(sent.len(), 1);
    assert_eq!(
        header_value(&sent[0], "authorization"),
        Some("Bearer virtual-token")
    );
    assert_eq!(header_value(&sent[0], "impersonate-user"), None);
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_tokens_are_unauthorized() {
    let clusters = clusters();

    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::GET,
            "/api/v1/namespaces/default/pods",
            Some("forged"),
            Bytes::new(),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
    let status = read_json(rsp).await;
    assert_eq!(status["reason"], "Unauthorized");
    assert_eq!(status["message"], "invalid bearer token");
    assert!(clusters.virt.requests_for("list", "pods").is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn unauthenticated_bodies_are_not_read() {
    let clusters = clusters();

    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::POST,
            "/api/v1/namespaces/default/services",
            Some("forged"),
            Bytes::from(vec![b' '; MAX_BODY_SIZE + 1]),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "current_thread")]
async fn oversized_bodies_are_rejected_after_admission() {
    let clusters = clusters();
    review_access(&clusters.virt, |_| true);

    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::POST,
            "/api/v1/namespaces/default/services",
            Some(HOST_TOKEN),
            Bytes::from(vec![b' '; MAX_BODY_SIZE + 1]),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
    assert!(clusters.host.requests_for("create", "services").is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn impersonation_requires_a_host_grant() {
    let clusters = clusters();
    review_access(&clusters.host, |_| false);

    let mut req = request(
        Method::GET,
        "/api/v1/namespaces/default/pods",
        Some(HOST_TOKEN),
        Bytes::new(),
    );
    req.headers_mut()
        .insert("impersonate-user", header::HeaderValue::from_static("root"));
    let rsp = gateway(&clusters)
        .oneshot(req)
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);
    assert_eq!(clusters.host.requests_for("create", "subjectaccessreviews").len(), 1);
    assert!(clusters.virt.requests_for("list", "pods").is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn gateway_writes_respect_virtual_rbac() {
    let clusters = clusters();
    review_access(&clusters.virt, |spec| {
        spec["resourceAttributes"]["resource"] != "services"
    });

    let svc = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"ports": [{"port": 80}]},
    });
    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::POST,
            "/api/v1/namespaces/default/services",
            Some(HOST_TOKEN),
            Bytes::from(svc.to_string()),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::FORBIDDEN);

    let reviews = clusters.virt.requests_for("create", "subjectaccessreviews");
    assert_eq!(reviews.len(), 1);
    let review = body(&reviews[0]).unwrap_or_default();
    assert_eq!(review["spec"]["user"], "alice");
    assert!(clusters.host.requests_for("create", "services").is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn gateway_writes_reach_the_host_when_allowed() {
    let clusters = clusters();
    review_access(&clusters.virt, |_| true);

    let svc = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "web", "namespace": "default"},
        "spec": {"ports": [{"port": 80}]},
    });
    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::POST,
            "/api/v1/namespaces/default/services",
            Some(HOST_TOKEN),
            Bytes::from(svc.to_string()),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::CREATED);
    assert_eq!(clusters.host.requests_for("create", "services").len(), 1);
    assert_eq!(clusters.virt.requests_for("create", "services").len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn delegation_failures_are_internal_errors() {
    let clusters = clusters();
    clusters.host.fail_next(
        "create",
        "tokenreviews",
        StatusError::internal("authentication webhook unavailable"),
    );

    let rsp = gateway(&clusters)
        .oneshot(request(
            Method::GET,
            "/api/v1/namespaces/default/pods",
            Some(HOST_TOKEN),
            Bytes::new(),
        ))
        .await
        .expect("gateway is infallible");
    assert_eq!(rsp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
