#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod apiservice;
mod context;
mod error;
pub mod filters;
mod forward;
mod gateway;
mod impersonate;
pub mod metrics;
pub mod nodes;
mod pipeline;

pub use self::{
    context::{PeerCertificate, ProxyRequest, RequestContext},
    error::Error,
    forward::{Credentials, Upstream},
    gateway::Gateway,
    nodes::NodeResolver,
    pipeline::{Filter, Outcome, Pipeline},
};
pub use vcluster_gateway_auth as auth;
pub use vcluster_gateway_core as core;
pub use vcluster_gateway_k8s_api as k8s;

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type BoxBody = UnsyncBoxBody<Bytes, BoxError>;
pub type Response = http::Response<BoxBody>;

/// Admitted requests are buffered up to this size before they are handled.
pub const MAX_BODY_SIZE: usize = 3 * 1024 * 1024;

pub fn full(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> BoxBody {
    full(Bytes::new())
}

pub(crate) fn json_response<T: serde::Serialize>(
    status: http::StatusCode,
    value: &T,
) -> Result<Response, Error> {
    let body = serde_json::to_vec(value).map_err(Error::Encode)?;
    let mut rsp = http::Response::new(full(body));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    Ok(rsp)
}
