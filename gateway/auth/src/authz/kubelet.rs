use super::HostCheck;
use vcluster_gateway_core::{Attributes, Authorizer, Verdict};

/// Authorizes requests addressed to a node's kubelet API.
///
/// Stats, metrics, logs and spec paths are checked as the matching `nodes`
/// subresource; other paths are checked as non-resource requests.
pub struct KubeletAuthorizer {
    host: HostCheck,
}

// === impl KubeletAuthorizer ===

impl KubeletAuthorizer {
    pub fn new(host: HostCheck) -> Self {
        Self { host }
    }

    /// The resource check equivalent to a kubelet path, if there is one.
    pub(crate) fn resource_attributes(attrs: &Attributes, node: &str) -> Option<Attributes> {
        let first = attrs.path.trim_start_matches('/').split('/').next()?;
        let subresource = match first {
            "stats" => "stats",
            "metrics" => "metrics",
            "logs" => "log",
            "spec" => "spec",
            _ => return None,
        };
        let verb = match attrs.verb.as_str() {
            "post" => "create",
            "put" => "update",
            "patch" => "patch",
            "delete" => "delete",
            _ => "get",
        };
        Some(Attributes {
            user: attrs.user.clone(),
            verb: verb.to_string(),
            resource_request: true,
            api_version: "v1".to_string(),
            resource: "nodes".to_string(),
            subresource: subresource.to_string(),
            name: node.to_string(),
            node: attrs.node.clone(),
            ..Attributes::default()
        })
    }
}

#[async_trait::async_trait]
impl Authorizer for KubeletAuthorizer {
    fn name(&self) -> &'static str {
        "kubelet"
    }

    async fn authorize(&self, attrs: &Attributes) -> anyhow::Result<Verdict> {
        let Some(node) = attrs.node.as_deref() else {
            return Ok(Verdict::no_opinion());
        };
        if attrs.resource_request {
            return Ok(Verdict::deny(format!(
                "resource requests are not served by the kubelet API of node {node:?}"
            )));
        }
        match Self::resource_attributes(attrs, node) {
            Some(resource) => self.host.check(&resource).await,
            None => self.host.check(attrs).await,
        }
    }
}
