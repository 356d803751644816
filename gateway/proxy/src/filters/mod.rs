//! Request filters that serve virtual cluster resources backed by the host.

pub mod admission;
mod kubelet;
mod metrics_server;
mod node;
mod service;
mod subresource;
mod tunnel;

pub use self::{
    kubelet::FakeKubelet,
    metrics_server::MetricsServerProxy,
    node::NodeWrite,
    service::{ServiceWrite, SKIP_DELETE_ANNOTATION},
    subresource::SubresourceRedirect,
    tunnel::K3sTunnel,
};
