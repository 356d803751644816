use super::*;
use bytes::Bytes;
use http::Method;
use http_body_util::{BodyExt, Full};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use vcluster_gateway_k8s_api::StatusError;

#[test]
fn backoff_delays() {
    let mut backoff = Backoff::default();
    let delays = (0..12).map(|_| backoff.next_delay()).collect::<Vec<_>>();
    assert_eq!(delays[0], time::Duration::from_secs(1));
    assert_eq!(delays[1], time::Duration::from_millis(1500));
    assert_eq!(delays[2], time::Duration::from_millis(2250));
    assert_eq!(delays[11], Backoff::MAX);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
}

/// Records requests and answers them from a script. Unscripted writes echo
/// the submitted object and unscripted deletes succeed.
#[derive(Clone, Default)]
struct Script {
    calls: Arc<Mutex<Vec<(Method, String)>>>,
    replies: Arc<Mutex<Vec<StatusError>>>,
}

impl Script {
    fn client(&self) -> kube::Client {
        let script = self.clone();
        let svc = tower::service_fn(move |req: http::Request<kube::client::Body>| {
            let script = script.clone();
            async move {
                let method = req.method().clone();
                script
                    .calls
                    .lock()
                    .push((method.clone(), req.uri().path().to_string()));
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let rsp = {
                    let mut replies = script.replies.lock();
                    (!replies.is_empty()).then(|| replies.remove(0))
                };
                let rsp = match rsp {
                    Some(error) => error.to_response(),
                    None if method == Method::DELETE => http::Response::new(Bytes::from_static(
                        br#"{"kind":"Status","apiVersion":"v1","metadata":{},"status":"Success"}"#,
                    )),
                    None => http::Response::new(body),
                };
                Ok::<_, std::convert::Infallible>(rsp.map(Full::new))
            }
        });
        kube::Client::new(svc, "default")
    }

    fn calls(&self) -> Vec<(Method, String)> {
        self.calls.lock().clone()
    }
}

#[tokio::test(start_paused = true)]
async fn registers_after_failures() {
    let script = Script::default();
    *script.replies.lock() = vec![
        StatusError::internal("etcd unavailable"),
        StatusError::internal("etcd unavailable"),
        StatusError::new(Reason::AlreadyExists, "services \"metrics-server\" already exists"),
    ];
    let (_signal, watch) = drain::channel();

    let start = time::Instant::now();
    reconcile(script.client(), Registration::metrics(8444), true, watch).await;
    assert_eq!(start.elapsed(), time::Duration::from_millis(2500));

    let services = "/api/v1/namespaces/kube-system/services".to_string();
    let api_services = "/apis/apiregistration.k8s.io/v1/apiservices".to_string();
    assert_eq!(
        script.calls(),
        vec![
            (Method::POST, services.clone()),
            (Method::POST, services.clone()),
            (Method::POST, services.clone()),
            (Method::PATCH, format!("{services}/metrics-server")),
            (Method::POST, api_services),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn deregisters_missing_objects() {
    let script = Script::default();
    *script.replies.lock() = vec![
        StatusError::not_found("apiregistration.k8s.io", "apiservices", "v1beta1.metrics.k8s.io"),
        StatusError::not_found("", "services", "metrics-server"),
    ];
    let (_signal, watch) = drain::channel();
    reconcile(script.client(), Registration::metrics(8444), false, watch).await;
    assert_eq!(
        script.calls(),
        vec![
            (
                Method::DELETE,
                "/apis/apiregistration.k8s.io/v1/apiservices/v1beta1.metrics.k8s.io".to_string()
            ),
            (
                Method::DELETE,
                "/api/v1/namespaces/kube-system/services/metrics-server".to_string()
            ),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stops_when_drained() {
    let script = Script::default();
    *script.replies.lock() = (0..100)
        .map(|_| StatusError::internal("etcd unavailable"))
        .collect();
    let (signal, watch) = drain::channel();
    let task = tokio::spawn(reconcile(
        script.client(),
        Registration::metrics(8444),
        true,
        watch,
    ));
    time::sleep(time::Duration::from_secs(3)).await;
    signal.drain().await;
    task.await.unwrap();
    assert_eq!(script.calls().len(), 3);
}

#[test]
fn external_name_service() {
    let registration = Registration::metrics(8444);
    let svc = registration.service();
    let spec = svc.spec.unwrap();
    assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
    assert_eq!(spec.external_name.as_deref(), Some("localhost"));
    assert_eq!(spec.ports.unwrap()[0].port, 8444);

    let api = registration.api_service();
    assert_eq!(api.metadata.name.as_deref(), Some("v1beta1.metrics.k8s.io"));
    let reference = api.spec.unwrap().service.unwrap();
    assert_eq!(reference.port, Some(8444));
}
