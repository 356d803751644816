#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod api;

pub use self::api::{FakeApiServer, Recorded};

use bytes::Bytes;
use http_body_util::BodyExt;
use std::{collections::BTreeMap, sync::Arc};
use vcluster_gateway_core::{
    translate::SingleNamespace, Authenticated, RequestInfo, Source, Translator, UserInfo,
};
use vcluster_gateway_proxy::{ProxyRequest, RequestContext, Response};

/// Host namespace the test installation syncs into.
pub const TARGET_NAMESPACE: &str = "vc-ns";

/// Installation name used to disambiguate host object names.
pub const VCLUSTER: &str = "vc";

/// A host and a virtual cluster, each served in memory.
#[derive(Clone, Default)]
pub struct Clusters {
    pub host: FakeApiServer,
    pub virt: FakeApiServer,
}

impl Clusters {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn translator() -> Arc<dyn Translator> {
    match SingleNamespace::new(TARGET_NAMESPACE, VCLUSTER) {
        Ok(t) => Arc::new(t),
        Err(error) => panic!("invalid test installation: {error}"),
    }
}

pub fn admin() -> Authenticated {
    Authenticated {
        user: UserInfo {
            name: "kubernetes-admin".to_string(),
            groups: vec!["system:masters".to_string()],
            ..UserInfo::default()
        },
        source: Source::Host,
    }
}

/// Builds a request as the gateway hands it to filters once the caller has
/// been admitted.
pub fn proxy_request(
    method: http::Method,
    uri: &str,
    content_type: Option<&str>,
    body: impl Into<Bytes>,
) -> ProxyRequest {
    let mut builder = http::Request::builder().method(method).uri(uri);
    if let Some(ct) = content_type {
        builder = builder.header(http::header::CONTENT_TYPE, ct);
    }
    let (parts, ()) = match builder.body(()) {
        Ok(req) => req.into_parts(),
        Err(error) => panic!("invalid request {uri}: {error}"),
    };
    let info = RequestInfo::parse(&parts.method, parts.uri.path(), parts.uri.query());
    ProxyRequest {
        parts,
        body: body.into(),
        cx: RequestContext {
            info,
            user: admin(),
            impersonated: false,
            node: None,
            needs_rbac: false,
        },
        upgrade: None,
    }
}

pub fn json_body<T: serde::Serialize>(value: &T) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(body) => Bytes::from(body),
        Err(error) => panic!("value must serialize: {error}"),
    }
}

pub async fn read_body(rsp: Response) -> Bytes {
    match rsp.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(error) => panic!("failed to read response body: {error}"),
    }
}

pub async fn read_json(rsp: Response) -> serde_json::Value {
    let body = read_body(rsp).await;
    match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(error) => panic!("response is not JSON ({error}): {}", String::from_utf8_lossy(&body)),
    }
}

pub fn labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vcluster=trace,debug")),
            )
            .finish(),
    )
}
