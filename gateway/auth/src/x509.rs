use vcluster_gateway_core::{authn::AUTHENTICATED_GROUP, UserInfo};
use x509_parser::prelude::*;

/// Maps a verified client certificate to an identity: the subject common
/// name is the user and each organization is a group.
///
/// Chain verification happens during the TLS handshake; this only reads the
/// leaf certificate.
#[derive(Clone, Debug, Default)]
pub struct ClientCertAuthenticator(());

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("failed to parse client certificate: {0}")]
    Parse(String),

    #[error("client certificate has no common name")]
    NoCommonName,
}

// === impl ClientCertAuthenticator ===

impl ClientCertAuthenticator {
    pub fn new() -> Self {
        Self(())
    }

    pub fn authenticate(&self, leaf_der: &[u8]) -> Result<UserInfo, CertError> {
        let (_, cert) =
            X509Certificate::from_der(leaf_der).map_err(|e| CertError::Parse(e.to_string()))?;
        let subject = cert.subject();

        let name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .filter(|cn| !cn.is_empty())
            .ok_or(CertError::NoCommonName)?
            .to_string();

        let mut groups = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if !groups.iter().any(|g| g == AUTHENTICATED_GROUP) {
            groups.push(AUTHENTICATED_GROUP.to_string());
        }

        Ok(UserInfo {
            name,
            groups,
            ..UserInfo::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};

    fn cert(cn: Option<&str>, orgs: &[&str]) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if let Some(cn) = cn {
            dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        }
        for org in orgs {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
        }
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn maps_subject_to_identity() {
        let der = cert(Some("system:node:worker-1"), &["system:nodes"]);
        let user = ClientCertAuthenticator::new().authenticate(&der).unwrap();
        assert_eq!(user.name, "system:node:worker-1");
        assert_eq!(
            user.groups,
            vec!["system:nodes".to_string(), AUTHENTICATED_GROUP.to_string()]
        );
    }

    #[test]
    fn requires_common_name() {
        let der = cert(None, &["admins"]);
        assert!(matches!(
            ClientCertAuthenticator::new().authenticate(&der),
            Err(CertError::NoCommonName)
        ));
        assert!(matches!(
            ClientCertAuthenticator::new().authenticate(b"garbage"),
            Err(CertError::Parse(_))
        ));
    }
}
