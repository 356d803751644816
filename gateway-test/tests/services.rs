use http::{Method, StatusCode};
use pretty_assertions::assert_eq;
use vcluster_gateway_k8s_api::{ObjectMeta, Service, ServicePort, ServiceSpec, StatusError};
use vcluster_gateway_proxy::{
    filters::{ServiceWrite, SKIP_DELETE_ANNOTATION},
    Filter, Outcome,
};
use vcluster_gateway_test::{
    init_tracing, json_body, labels, proxy_request, read_json, translator, Clusters,
    TARGET_NAMESPACE,
};

const HOST_NAME: &str = "web-x-default-x-vc";

fn service(type_: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web".to_string()),
            namespace: Some("default".to_string()),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            external_name: (type_ == "ExternalName").then(|| "example.com".to_string()),
            selector: (type_ != "ExternalName").then(|| labels([("app", "web")])),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: 80,
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    }
}

fn host_service(type_: &str) -> Service {
    let mut svc = service(type_);
    svc.metadata.name = Some(HOST_NAME.to_string());
    svc.metadata.namespace = Some(TARGET_NAMESPACE.to_string());
    svc
}

fn filter(clusters: &Clusters) -> ServiceWrite {
    ServiceWrite::new(clusters.host.client(), clusters.virt.client(), translator())
}

fn cluster_ip(svc: &Service) -> Option<String> {
    svc.spec.as_ref().and_then(|s| s.cluster_ip.clone())
}

#[tokio::test(flavor = "current_thread")]
async fn creates_host_service_first() {
    let _tracing = init_tracing();
    let clusters = Clusters::new();

    let req = proxy_request(
        Method::POST,
        "/api/v1/namespaces/default/services",
        Some("application/json"),
        json_body(&service("ClusterIP")),
    );
    let rsp = match filter(&clusters).handle(req).await {
        Ok(Outcome::Respond(rsp)) => rsp,
        res => panic!("unexpected outcome: {res:?}"),
    };
    assert_eq!(rsp.status(), StatusCode::CREATED);
    let created = read_json(rsp).await;

    let host = clusters
        .host
        .get::<Service>(Some(TARGET_NAMESPACE), HOST_NAME)
        .expect("host service must exist");
    let virt = clusters
        .virt
        .get::<Service>(Some("default"), "web")
        .expect("virtual service must exist");

    let ip = cluster_ip(&host).expect("host must allocate a cluster IP");
    assert_eq!(cluster_ip(&virt), Some(ip.clone()));
    assert_eq!(created["spec"]["clusterIP"], ip);

    let annotations = host.metadata.annotations.unwrap_or_default();
    assert_eq!(
        annotations.get(SKIP_DELETE_ANNOTATION).map(String::as_str),
        Some("true")
    );
    let selector = host.spec.and_then(|s| s.selector).unwrap_or_default();
    let key = translator().host_label("app");
    assert_eq!(selector.get(&key).map(String::as_str), Some("web"));
}

#[tokio::test(flavor = "current_thread")]
async fn removes_host_service_when_virtual_create_fails() {
    let _tracing = init_tracing();
    let clusters = Clusters::new();
    clusters
        .virt
        .fail_next("create", "services", StatusError::internal("etcd unavailable"));

    let req = proxy_request(
        Method::POST,
        "/api/v1/namespaces/default/services",
        Some("application/json"),
        json_body(&service("ClusterIP")),
    );
    let error = match filter(&clusters).handle(req).await {
        Err(error) => error,
        res => panic!("unexpected outcome: {res:?}"),
    };
    assert_eq!(error.status().code, 500);
    assert_eq!(error.status().message, "etcd unavailable");

    assert_eq!(clusters.host.requests_for("create", "services").len(), 1);
    assert_eq!(clusters.host.requests_for("delete", "services").len(), 1);
    assert!(clusters
        .host
        .get::<Service>(Some(TARGET_NAMESPACE), HOST_NAME)
        .is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn converts_external_name_services() {
    let _tracing = init_tracing();
    let clusters = Clusters::new();
    clusters.virt.insert(&service("ExternalName"));
    clusters.host.insert(&host_service("ExternalName"));

    let mut desired = clusters
        .virt
        .get::<Service>(Some("default"), "web")
        .expect("virtual service must exist");
    desired.spec = service("ClusterIP").spec;

    let req = proxy_request(
        Method::PUT,
        "/api/v1/namespaces/default/services/web",
        Some("application/json"),
        json_body(&desired),
    );
    let rsp = match filter(&clusters).handle(req).await {
        Ok(Outcome::Respond(rsp)) => rsp,
        res => panic!("unexpected outcome: {res:?}"),
    };
    assert_eq!(rsp.status(), StatusCode::OK);

    let host = clusters
        .host
        .get::<Service>(Some(TARGET_NAMESPACE), HOST_NAME)
        .expect("host service must exist");
    let virt = clusters
        .virt
        .get::<Service>(Some("default"), "web")
        .expect("virtual service must exist");

    let host_spec = host.spec.clone().unwrap_or_default();
    assert_eq!(host_spec.type_.as_deref(), Some("ClusterIP"));
    assert_eq!(host_spec.external_name, None);
    assert!(cluster_ip(&host).is_some());
    assert_eq!(cluster_ip(&virt), cluster_ip(&host));
    assert_eq!(
        virt.spec.and_then(|s| s.type_).as_deref(),
        Some("ClusterIP")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn replaces_host_selectors() {
    let clusters = Clusters::new();
    clusters.virt.insert(&service("ExternalName"));
    let mut stale = host_service("ExternalName");
    let legacy = translator().host_label("legacy");
    stale.spec.get_or_insert_with(Default::default).selector =
        Some(labels([(legacy.as_str(), "true")]));
    clusters.host.insert(&stale);

    let mut desired = clusters
        .virt
        .get::<Service>(Some("default"), "web")
        .expect("virtual service must exist");
    desired.spec = service("ClusterIP").spec;

    let req = proxy_request(
        Method::PUT,
        "/api/v1/namespaces/default/services/web",
        Some("application/json"),
        json_body(&desired),
    );
    match filter(&clusters).handle(req).await {
        Ok(Outcome::Respond(rsp)) => assert_eq!(rsp.status(), StatusCode::OK),
        res => panic!("unexpected outcome: {res:?}"),
    }

    let selector = clusters
        .host
        .get::<Service>(Some(TARGET_NAMESPACE), HOST_NAME)
        .and_then(|svc| svc.spec)
        .and_then(|spec| spec.selector)
        .unwrap_or_default();
    assert!(!selector.contains_key(&legacy));
    let app = translator().host_label("app");
    assert_eq!(selector.get(&app).map(String::as_str), Some("web"));
}

#[tokio::test(flavor = "current_thread")]
async fn rejects_non_json_bodies() {
    let clusters = Clusters::new();
    clusters.virt.insert(&service("ExternalName"));

    let req = proxy_request(
        Method::PUT,
        "/api/v1/namespaces/default/services/web",
        Some("application/vnd.kubernetes.protobuf"),
        "k8s\0",
    );
    let error = match filter(&clusters).handle(req).await {
        Err(error) => error,
        res => panic!("unexpected outcome: {res:?}"),
    };
    assert_eq!(error.status().code, 415);
    assert!(clusters.host.requests().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn removes_host_service_when_virtual_update_fails() {
    let _tracing = init_tracing();
    let clusters = Clusters::new();
    clusters.virt.insert(&service("ExternalName"));
    clusters.host.insert(&host_service("ExternalName"));
    clusters
        .virt
        .fail_next("update", "services", StatusError::internal("etcd unavailable"));

    let mut desired = clusters
        .virt
        .get::<Service>(Some("default"), "web")
        .expect("virtual service must exist");
    desired.spec = service("ClusterIP").spec;

    let req = proxy_request(
        Method::PUT,
        "/api/v1/namespaces/default/services/web",
        Some("application/json"),
        json_body(&desired),
    );
    assert!(filter(&clusters).handle(req).await.is_err());
    assert!(clusters
        .host
        .get::<Service>(Some(TARGET_NAMESPACE), HOST_NAME)
        .is_none());
    // The virtual service is untouched.
    let virt = clusters
        .virt
        .get::<Service>(Some("default"), "web")
        .expect("virtual service must exist");
    assert_eq!(
        virt.spec.and_then(|s| s.type_).as_deref(),
        Some("ExternalName")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn rejects_stale_updates() {
    let clusters = Clusters::new();
    clusters.virt.insert(&service("ExternalName"));
    clusters.host.insert(&host_service("ExternalName"));

    let mut desired = service("ClusterIP");
    desired.metadata.resource_version = Some("0".to_string());
    let req = proxy_request(
        Method::PUT,
        "/api/v1/namespaces/default/services/web",
        Some("application/json"),
        json_body(&desired),
    );
    let error = match filter(&clusters).handle(req).await {
        Err(error) => error,
        res => panic!("unexpected outcome: {res:?}"),
    };
    assert_eq!(error.status().code, 409);
    assert!(clusters.host.requests_for("patch", "services").is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn passes_other_updates_through() {
    let clusters = Clusters::new();
    clusters.virt.insert(&service("ClusterIP"));

    let req = proxy_request(
        Method::PUT,
        "/api/v1/namespaces/default/services/web",
        Some("application/json"),
        json_body(&service("NodePort")),
    );
    match filter(&clusters).handle(req).await {
        Ok(Outcome::Continue(_)) => {}
        res => panic!("unexpected outcome: {res:?}"),
    }
    assert!(clusters.host.requests().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn passes_dry_runs_through() {
    let clusters = Clusters::new();
    let req = proxy_request(
        Method::POST,
        "/api/v1/namespaces/default/services?dryRun=All",
        Some("application/json"),
        json_body(&service("ClusterIP")),
    );
    match filter(&clusters).handle(req).await {
        Ok(Outcome::Continue(_)) => {}
        res => panic!("unexpected outcome: {res:?}"),
    }
    assert!(clusters.host.requests().is_empty());
}
