use crate::{Error, Material};
use parking_lot::RwLock;
use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use std::sync::Arc;

/// The current serving certificate, shared between the syncer and the TLS
/// listeners.
#[derive(Clone, Debug, Default)]
pub struct CertStore(Arc<RwLock<Option<Current>>>);

#[derive(Debug)]
struct Current {
    material: Material,
    key: Arc<CertifiedKey>,
}

/// Hands the current certificate to every TLS handshake.
#[derive(Clone, Debug)]
pub struct Resolver(CertStore);

// === impl CertStore ===

impl CertStore {
    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::new(Resolver(self.clone()))
    }

    pub fn certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.0.read().as_ref().map(|c| c.key.clone())
    }

    pub fn material(&self) -> Option<Material> {
        self.0.read().as_ref().map(|c| c.material.clone())
    }

    pub fn sans(&self) -> Option<Vec<String>> {
        self.0.read().as_ref().map(|c| c.material.sans.clone())
    }

    /// Replaces the certificate. Invalid material leaves the current
    /// certificate in place.
    pub(crate) fn swap(&self, material: Material) -> Result<(), Error> {
        let key = Arc::new(certified_key(&material)?);
        *self.0.write() = Some(Current { material, key });
        Ok(())
    }
}

fn certified_key(material: &Material) -> Result<CertifiedKey, Error> {
    let chain = rustls_pemfile::certs(&mut material.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(Error::MissingCertificate);
    }
    let key = rustls_pemfile::private_key(&mut material.key_pem.as_bytes())?
        .ok_or(Error::MissingKey)?;
    let key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(chain, key))
}

// === impl Resolver ===

impl ResolvesServerCert for Resolver {
    fn resolve(&self, _: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.certified_key()
    }
}
