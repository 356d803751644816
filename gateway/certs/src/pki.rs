use crate::Error;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, Issuer,
    KeyPair, KeyUsagePurpose,
};

const COMMON_NAME: &str = "kube-apiserver";
const VALIDITY: time::Duration = time::Duration::days(365);
/// Tolerates clients with slightly skewed clocks.
const BACKDATE: time::Duration = time::Duration::hours(1);

/// PEM-encoded serving certificate and key with the names it was issued for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Material {
    pub cert_pem: String,
    pub key_pem: String,
    pub sans: Vec<String>,
}

/// Issues serving certificates.
pub trait Generator: Send + Sync {
    /// Issues a certificate for `sans`. When `existing` material is given its
    /// key is kept.
    fn generate(&self, existing: Option<&Material>, sans: &[String]) -> Result<Material, Error>;
}

/// Signs serving certificates with a CA key pair.
#[derive(Clone)]
pub struct CaSigner {
    ca_cert_pem: String,
    ca_key_pem: String,
}

// === impl CaSigner ===

impl CaSigner {
    pub fn from_pem(ca_cert_pem: impl Into<String>, ca_key_pem: impl Into<String>) -> Result<Self, Error> {
        let signer = Self {
            ca_cert_pem: ca_cert_pem.into(),
            ca_key_pem: ca_key_pem.into(),
        };
        // Fail at startup rather than on the first rotation.
        let key = KeyPair::from_pem(&signer.ca_key_pem)?;
        Issuer::from_ca_cert_pem(&signer.ca_cert_pem, &key)?;
        Ok(signer)
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

impl Generator for CaSigner {
    fn generate(&self, existing: Option<&Material>, sans: &[String]) -> Result<Material, Error> {
        if sans.is_empty() {
            return Err(Error::NoNames);
        }

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)?;

        let key = match existing {
            Some(existing) => KeyPair::from_pem(&existing.key_pem)?,
            None => KeyPair::generate()?,
        };

        let mut params = CertificateParams::new(sans.to_vec())?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(COMMON_NAME.to_string()));
        params.distinguished_name = dn;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - BACKDATE;
        params.not_after = now + VALIDITY;

        let cert = params.signed_by(&key, &issuer)?;
        Ok(Material {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            sans: sans.to_vec(),
        })
    }
}

impl std::fmt::Debug for CaSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaSigner").finish_non_exhaustive()
    }
}
