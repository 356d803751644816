use crate::{Error, Filter, Outcome, ProxyRequest, RequestContext, Upstream};
use tracing::debug;
use vcluster_gateway_core::authn::NODE_USER_PREFIX;
use vcluster_gateway_k8s_api::StatusError;

const TUNNEL_PATH: &str = "/v1-k3s/connect";

/// Passes node tunnel connections through to the control plane's tunnel
/// endpoint. Only nodes may open a tunnel.
pub struct K3sTunnel {
    upstream: Upstream,
}

impl K3sTunnel {
    pub fn new(upstream: Upstream) -> Self {
        Self { upstream }
    }
}

#[async_trait::async_trait]
impl Filter for K3sTunnel {
    fn name(&self) -> &'static str {
        "tunnel"
    }

    fn matches(&self, cx: &RequestContext) -> bool {
        cx.info.path.ends_with(TUNNEL_PATH)
    }

    fn enforces_rbac(&self) -> bool {
        false
    }

    async fn handle(&self, req: ProxyRequest) -> Result<Outcome, Error> {
        let user = &req.cx.user.user.name;
        if !user.starts_with(NODE_USER_PREFIX) {
            return Err(StatusError::forbidden(format!(
                "user {user:?} is not allowed to open a node tunnel"
            ))
            .into());
        }
        debug!(%user, upgrade = req.upgrade.is_some(), "Opening node tunnel");
        self.upstream.forward(req).await.map(Outcome::Respond)
    }
}
