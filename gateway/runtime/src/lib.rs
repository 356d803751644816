#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use vcluster_gateway_auth as auth;
pub use vcluster_gateway_certs as certs;
pub use vcluster_gateway_core as core;
pub use vcluster_gateway_k8s_api as k8s;
pub use vcluster_gateway_proxy as proxy;

pub mod apiservice;
mod args;
mod server;

pub use self::args::Args;
