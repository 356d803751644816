use crate::{authn::UserInfo, request::RequestInfo};
use std::fmt;

/// The security-relevant view of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub user: UserInfo,
    pub verb: String,
    pub resource_request: bool,

    pub namespace: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,

    pub path: String,

    /// The virtual node the request is addressed to, when its `Host` header
    /// resolved to a known node.
    pub node: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    Allow,
    Deny,
    NoOpinion,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
}

#[async_trait::async_trait]
pub trait Authorizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authorize(&self, attrs: &Attributes) -> anyhow::Result<Verdict>;
}

// === impl Attributes ===

impl Attributes {
    pub fn new(user: UserInfo, info: &RequestInfo, node: Option<String>) -> Self {
        Self {
            user,
            verb: info.verb.clone(),
            resource_request: info.is_resource_request,
            namespace: info.namespace.clone(),
            api_group: info.api_group.clone(),
            api_version: info.api_version.clone(),
            resource: info.resource.clone(),
            subresource: info.subresource.clone(),
            name: info.name.clone(),
            path: info.path.clone(),
            node,
        }
    }

    /// A stable digest of every field a delegated decision depends on. Used
    /// as the key of decision caches.
    pub fn cache_key(&self) -> String {
        let mut buf = String::new();
        let mut push = |field: &str| {
            buf.push_str(field);
            buf.push('\0');
        };
        push(&self.user.name);
        push(&self.user.uid);
        for group in &self.user.groups {
            push(group);
        }
        push("--");
        for (key, values) in &self.user.extra {
            push(key);
            for v in values {
                push(v);
            }
        }
        push("--");
        push(&self.verb);
        if self.resource_request {
            push(&self.namespace);
            push(&self.api_group);
            push(&self.api_version);
            push(&self.resource);
            push(&self.subresource);
            push(&self.name);
        } else {
            push(&self.path);
        }
        crate::sha256_hex(buf.as_bytes())
    }
}

impl fmt::Display for Attributes {
    /// Renders the attributes the way the API server words forbidden errors.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User {:?} cannot {}", self.user.name, self.verb)?;
        if !self.resource_request {
            return write!(f, " path {:?}", self.path);
        }
        write!(f, " resource {:?}", self.resource)?;
        if !self.subresource.is_empty() {
            write!(f, "/{:?}", self.subresource)?;
        }
        write!(f, " in API group {:?}", self.api_group)?;
        if self.namespace.is_empty() {
            write!(f, " at the cluster scope")
        } else {
            write!(f, " in the namespace {:?}", self.namespace)
        }
    }
}

// === impl Verdict ===

impl Verdict {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    pub fn no_opinion() -> Self {
        Self {
            decision: Decision::NoOpinion,
            reason: String::new(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}
