use std::collections::BTreeMap;

pub const ANONYMOUS_USER: &str = "system:anonymous";
pub const UNAUTHENTICATED_GROUP: &str = "system:unauthenticated";
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";
pub const NODES_GROUP: &str = "system:nodes";
pub const NODE_USER_PREFIX: &str = "system:node:";

/// The identity a request is made on behalf of.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub name: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Where an identity was established.
///
/// Identities issued by the virtual cluster (or no identity at all) can be
/// forwarded to the virtual API server with their original credentials; all
/// other identities must be impersonated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Host,
    Virtual,
    Certificate,
    Anonymous,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authenticated {
    pub user: UserInfo,
    pub source: Source,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenOutcome {
    Authenticated(UserInfo),
    Rejected { reason: String },
}

/// Resolves a bearer token to an identity.
///
/// Transport failures are returned as errors; a token the issuer does not
/// recognize is a [`TokenOutcome::Rejected`].
#[async_trait::async_trait]
pub trait TokenAuthenticator: Send + Sync {
    async fn authenticate_token(&self, token: &str) -> anyhow::Result<TokenOutcome>;
}

// === impl UserInfo ===

impl UserInfo {
    pub fn anonymous() -> Self {
        Self {
            name: ANONYMOUS_USER.to_string(),
            groups: vec![UNAUTHENTICATED_GROUP.to_string()],
            ..Self::default()
        }
    }

    /// Returns the node name when this identity is a kubelet.
    pub fn node_name(&self) -> Option<&str> {
        self.name
            .strip_prefix(NODE_USER_PREFIX)
            .filter(|name| !name.is_empty())
    }

    pub fn is_anonymous(&self) -> bool {
        self.name == ANONYMOUS_USER
    }
}

// === impl Authenticated ===

impl Authenticated {
    pub fn anonymous() -> Self {
        Self {
            user: UserInfo::anonymous(),
            source: Source::Anonymous,
        }
    }

    /// Whether the caller's own credentials are valid against the virtual API server.
    pub fn is_virtual_native(&self) -> bool {
        matches!(self.source, Source::Virtual | Source::Anonymous)
    }
}
