#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod authn;
pub mod authz;
mod chain;
mod x509;

pub use self::{
    authn::DelegatingAuthenticator,
    chain::{bearer_token, Authenticators, Error},
    x509::{CertError, ClientCertAuthenticator},
};
pub use vcluster_gateway_core as core;
pub use vcluster_gateway_k8s_api as k8s;
