#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Serving certificates for the gateway's TLS listeners.
//!
//! A [`Syncer`] periodically collects the names the gateway is reachable
//! under and reissues the serving certificate from the cluster CA when they
//! change. Listeners read the current certificate through a [`Resolver`] on
//! every handshake, so a rotation never requires a restart.

mod pki;
mod san;
mod store;
mod syncer;

pub use self::{
    pki::{CaSigner, Generator, Material},
    san::{HostServiceSans, SanProvider, StaticSans},
    store::{CertStore, Resolver},
    syncer::{Syncer, SyncerMetrics, INTERVAL, JITTER},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("no private key found in PEM")]
    MissingKey,

    #[error("no certificate found in PEM")]
    MissingCertificate,

    #[error("failed to issue certificate: {0}")]
    Issue(#[from] rcgen::Error),

    #[error("invalid key material: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to look up serving names: {0}")]
    Lookup(#[from] kube::Error),

    #[error("no serving names were found")]
    NoNames,
}
