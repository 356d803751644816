//! Resolves the virtual node a request is addressed to.
//!
//! Kubelet clients (the API server's node proxy, metrics scrapers) dial a
//! node by name or address. When the gateway is reached that way the `Host`
//! header identifies the node.

use kube::runtime::reflector::Store;
use vcluster_gateway_k8s_api::Node;

pub trait NodeResolver: Send + Sync {
    /// Returns the name of the node `host` refers to. `host` may carry a port.
    fn resolve(&self, host: &str) -> Option<String>;
}

/// Resolves nothing.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoNodes;

impl NodeResolver for NoNodes {
    fn resolve(&self, _: &str) -> Option<String> {
        None
    }
}

impl NodeResolver for Store<Node> {
    fn resolve(&self, host: &str) -> Option<String> {
        let host = strip_port(host);
        if host.is_empty() {
            return None;
        }
        self.state().iter().find_map(|node| {
            let name = node.metadata.name.as_deref()?;
            let matched = name == host
                || node
                    .status
                    .as_ref()
                    .and_then(|s| s.addresses.as_ref())
                    .is_some_and(|addrs| addrs.iter().any(|a| a.address == host));
            matched.then(|| name.to_string())
        })
    }
}

/// Strips an optional port, and the brackets around an IPv6 literal.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map(|(ip, _)| ip).unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        // A bare IPv6 literal contains more than one colon.
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}
