#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod authn;
pub mod authz;
pub mod cache;
pub mod request;
pub mod translate;

pub use self::{
    authn::{Authenticated, Source, TokenAuthenticator, TokenOutcome, UserInfo},
    authz::{Attributes, Authorizer, Decision, Verdict},
    cache::TtlCache,
    request::RequestInfo,
    translate::{NamespacedName, Translator},
};

/// Hex-encodes the SHA-256 digest of `input`.
pub fn sha256_hex(input: &[u8]) -> String {
    use std::fmt::Write;

    let digest = ring::digest::digest(&ring::digest::SHA256, input);
    digest
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}
