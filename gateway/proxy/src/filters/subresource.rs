use super::admission;
use crate::{Error, Filter, Outcome, ProxyRequest, RequestContext, Upstream};
use kube::Api;
use std::sync::Arc;
use tracing::debug;
use vcluster_gateway_core::{RequestInfo, Translator};
use vcluster_gateway_k8s_api::{Pod, StatusError};

const RESOURCES: [&str; 3] = ["nodes", "pods", "services"];
const SUBRESOURCES: [&str; 5] = ["proxy", "exec", "attach", "portforward", "log"];

/// Sends node, pod and service subresource requests to the host cluster,
/// where the workloads actually run.
pub struct SubresourceRedirect {
    host: Upstream,
    virt: kube::Client,
    translator: Arc<dyn Translator>,
}

// === impl SubresourceRedirect ===

impl SubresourceRedirect {
    /// `host` must carry the gateway's own host credentials; `virt` is used
    /// to look up pods being connected to.
    pub fn new(host: Upstream, virt: kube::Client, translator: Arc<dyn Translator>) -> Self {
        Self {
            host,
            virt,
            translator,
        }
    }
}

#[async_trait::async_trait]
impl Filter for SubresourceRedirect {
    fn name(&self) -> &'static str {
        "subresource"
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        let info = &cx.info;
        info.is_resource_request
            && info.api_group.is_empty()
            && !info.name.is_empty()
            && RESOURCES.contains(&info.resource.as_str())
            && SUBRESOURCES.contains(&info.subresource.as_str())
    }

    async fn handle(&self, mut req: ProxyRequest) -> Result<Outcome, Error> {
        let info = &req.cx.info;
        if info.resource == "pods" && is_connect(&info.subresource) {
            let pod = Api::<Pod>::namespaced(self.virt.clone(), &info.namespace)
                .get(&info.name)
                .await?;
            admission::validate(&pod, &info.subresource, req.query())?;
        }

        let path = host_path(info, &*self.translator);
        debug!(from = %info.path, to = %path, "Redirecting to host");
        req.set_path(&path)
            .map_err(|e| StatusError::bad_request(e.to_string()))?;
        self.host.forward(req).await.map(Outcome::Respond)
    }
}

fn is_connect(subresource: &str) -> bool {
    matches!(subresource, "exec" | "attach" | "portforward")
}

/// The request path addressing the host counterpart of the object.
pub(crate) fn host_path(info: &RequestInfo, translator: &dyn Translator) -> String {
    if info.resource == "nodes" {
        return info.path_for("", &info.name);
    }

    // Proxy names may be qualified as `name:port` or `scheme:name:port`.
    let (scheme, name, port) = split_proxy_name(&info.name);
    let host = translator.to_host(&info.namespace, name);
    let mut qualified = String::new();
    if let Some(scheme) = scheme {
        qualified.push_str(scheme);
        qualified.push(':');
    }
    qualified.push_str(&host.name);
    if let Some(port) = port {
        qualified.push(':');
        qualified.push_str(port);
    }
    info.path_for(&host.namespace, &qualified)
}

fn split_proxy_name(name: &str) -> (Option<&str>, &str, Option<&str>) {
    let parts = name.split(':').collect::<Vec<_>>();
    match parts.as_slice() {
        [scheme, name, port] => (Some(scheme), name, Some(port)),
        [name, port] => (None, name, Some(port)),
        _ => (None, name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use vcluster_gateway_core::translate::SingleNamespace;

    #[rstest]
    #[case::log(
        "/api/v1/namespaces/default/pods/web/log",
        "/api/v1/namespaces/vc-ns/pods/web-x-default-x-vc/log"
    )]
    #[case::exec(
        "/api/v1/namespaces/default/pods/web/exec",
        "/api/v1/namespaces/vc-ns/pods/web-x-default-x-vc/exec"
    )]
    #[case::pod_proxy(
        "/api/v1/namespaces/default/pods/web:8080/proxy/healthz",
        "/api/v1/namespaces/vc-ns/pods/web-x-default-x-vc:8080/proxy/healthz"
    )]
    #[case::service_proxy(
        "/api/v1/namespaces/default/services/https:web:443/proxy/",
        "/api/v1/namespaces/vc-ns/services/https:web-x-default-x-vc:443/proxy/"
    )]
    #[case::node_proxy(
        "/api/v1/nodes/node-1/proxy/stats/summary",
        "/api/v1/nodes/node-1/proxy/stats/summary"
    )]
    fn rewrites_paths(#[case] path: &str, #[case] expected: &str) {
        let translator = SingleNamespace::new("vc-ns", "vc").unwrap();
        let info = RequestInfo::parse(&Method::GET, path, None);
        let rewritten = host_path(&info, &translator);
        assert_eq!(rewritten, expected);

        // The rewritten path classifies the same way apart from its identity.
        let again = RequestInfo::parse(&Method::GET, &rewritten, None);
        assert_eq!(again.verb, info.verb);
        assert_eq!(again.resource, info.resource);
        assert_eq!(again.subresource, info.subresource);
        assert_eq!(again.parts[3..], info.parts[3..]);
    }

    #[test]
    fn proxy_names() {
        assert_eq!(split_proxy_name("web"), (None, "web", None));
        assert_eq!(split_proxy_name("web:80"), (None, "web", Some("80")));
        assert_eq!(split_proxy_name("https:web:443"), (Some("https"), "web", Some("443")));
    }
}
