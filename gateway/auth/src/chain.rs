use crate::x509::{CertError, ClientCertAuthenticator};
use std::sync::Arc;
use tracing::debug;
use vcluster_gateway_core::{Authenticated, Source, TokenAuthenticator, TokenOutcome};

/// Resolves a request's credentials to an identity.
///
/// A client certificate is consulted first (when client certificate
/// authentication is enabled), then a bearer token is offered to the host
/// cluster and finally to the virtual cluster. A request that presents no
/// credentials is anonymous.
#[derive(Clone)]
pub struct Authenticators {
    certs: Option<ClientCertAuthenticator>,
    host: Arc<dyn TokenAuthenticator>,
    virt: Option<Arc<dyn TokenAuthenticator>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every authenticator rejected the credentials. Carries the host's reason.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Certificate(#[from] CertError),

    #[error("failed to delegate authentication: {0}")]
    Delegation(#[source] anyhow::Error),
}

// === impl Authenticators ===

impl Authenticators {
    pub fn new(host: Arc<dyn TokenAuthenticator>) -> Self {
        Self {
            certs: None,
            host,
            virt: None,
        }
    }

    pub fn with_virtual(mut self, virt: Arc<dyn TokenAuthenticator>) -> Self {
        self.virt = Some(virt);
        self
    }

    pub fn with_client_certs(mut self, certs: ClientCertAuthenticator) -> Self {
        self.certs = Some(certs);
        self
    }

    /// `peer_leaf` is the DER-encoded leaf certificate the client presented
    /// during the handshake, if any.
    pub async fn authenticate(
        &self,
        token: Option<&str>,
        peer_leaf: Option<&[u8]>,
    ) -> Result<Authenticated, Error> {
        if let (Some(certs), Some(leaf)) = (&self.certs, peer_leaf) {
            let user = certs.authenticate(leaf)?;
            debug!(user = %user.name, "Authenticated client certificate");
            return Ok(Authenticated {
                user,
                source: Source::Certificate,
            });
        }

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(Authenticated::anonymous());
        };

        let reason = match self
            .host
            .authenticate_token(token)
            .await
            .map_err(Error::Delegation)?
        {
            TokenOutcome::Authenticated(user) => {
                return Ok(Authenticated {
                    user,
                    source: Source::Host,
                })
            }
            TokenOutcome::Rejected { reason } => reason,
        };

        if let Some(virt) = &self.virt {
            if let TokenOutcome::Authenticated(user) = virt
                .authenticate_token(token)
                .await
                .map_err(Error::Delegation)?
            {
                return Ok(Authenticated {
                    user,
                    source: Source::Virtual,
                });
            }
        }

        Err(Error::Rejected(reason))
    }
}

/// Extracts the bearer token from an `Authorization` header value.
pub fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcluster_gateway_core::UserInfo;

    struct Tokens(&'static [(&'static str, &'static str)], &'static str);

    #[async_trait::async_trait]
    impl TokenAuthenticator for Tokens {
        async fn authenticate_token(&self, token: &str) -> anyhow::Result<TokenOutcome> {
            if token == "boom" {
                anyhow::bail!("connection refused");
            }
            Ok(match self.0.iter().find(|(t, _)| *t == token) {
                Some((_, name)) => TokenOutcome::Authenticated(UserInfo {
                    name: name.to_string(),
                    ..UserInfo::default()
                }),
                None => TokenOutcome::Rejected {
                    reason: self.1.to_string(),
                },
            })
        }
    }

    fn authenticators() -> Authenticators {
        Authenticators::new(Arc::new(Tokens(&[("host-token", "admin")], "host says no")))
            .with_virtual(Arc::new(Tokens(
                &[("sa-token", "system:serviceaccount:default:app")],
                "virtual says no",
            )))
    }

    #[tokio::test]
    async fn resolves_by_issuer() {
        let authn = authenticators();

        let host = authn.authenticate(Some("host-token"), None).await.unwrap();
        assert_eq!(host.user.name, "admin");
        assert_eq!(host.source, Source::Host);

        let virt = authn.authenticate(Some("sa-token"), None).await.unwrap();
        assert_eq!(virt.user.name, "system:serviceaccount:default:app");
        assert_eq!(virt.source, Source::Virtual);
        assert!(virt.is_virtual_native());

        let anon = authn.authenticate(None, None).await.unwrap();
        assert_eq!(anon, Authenticated::anonymous());
    }

    #[tokio::test]
    async fn rejected_with_host_reason() {
        let error = authenticators()
            .authenticate(Some("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Rejected(ref r) if r == "host says no"), "{error}");
    }

    #[tokio::test]
    async fn host_failures_are_not_masked() {
        let error = authenticators()
            .authenticate(Some("boom"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Delegation(_)), "{error}");
    }

    #[test]
    fn bearer_tokens() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
