use crate::{Error, ProxyRequest, RequestContext, Response, Upstream};
use std::sync::Arc;
use tracing::debug;
use vcluster_gateway_auth::authz::VirtualRbac;
use vcluster_gateway_core::Attributes;
use vcluster_gateway_k8s_api::StatusError;

#[cfg(test)]
mod tests;

/// A handler for a class of requests.
///
/// Filters are consulted in order; the first whose predicate matches handles
/// the request. A filter may still hand the request on, possibly rewritten.
#[async_trait::async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, cx: &RequestContext) -> bool;

    /// Whether the virtual cluster's RBAC must admit the request before the
    /// filter handles it.
    fn enforces_rbac(&self) -> bool {
        true
    }

    async fn handle(&self, req: ProxyRequest) -> Result<Outcome, Error>;
}

#[derive(Debug)]
pub enum Outcome {
    Respond(Response),
    Continue(ProxyRequest),
}

/// An ordered set of filters in front of the virtual API server.
#[derive(Clone)]
pub struct Pipeline {
    filters: Vec<Arc<dyn Filter>>,
    rbac: Option<Arc<VirtualRbac>>,
    passthrough: Upstream,
    privileged: Upstream,
}

/// The handler that produced a response.
pub type Handled = (&'static str, Result<Response, Error>);

/// Name reported for requests served by the virtual API server.
pub const VIRTUAL: &str = "virtual";

// === impl Pipeline ===

impl Pipeline {
    /// `passthrough` forwards the caller's own credentials to the virtual API
    /// server; `privileged` impersonates identities the virtual API server
    /// cannot authenticate.
    pub fn new(passthrough: Upstream, privileged: Upstream) -> Self {
        Self {
            filters: Vec::new(),
            rbac: None,
            passthrough,
            privileged,
        }
    }

    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn with_rbac(mut self, rbac: VirtualRbac) -> Self {
        self.rbac = Some(Arc::new(rbac));
        self
    }

    pub async fn dispatch(&self, mut req: ProxyRequest) -> Handled {
        let mut checked = false;
        for filter in &self.filters {
            if !filter.matches(&req.cx) {
                continue;
            }

            if filter.enforces_rbac() && req.cx.needs_rbac && !checked {
                if let Err(error) = self.authorize(&req.cx).await {
                    return (filter.name(), Err(error));
                }
                checked = true;
            }

            debug!(filter = filter.name(), path = %req.cx.info.path, "Handling");
            match filter.handle(req).await {
                Ok(Outcome::Respond(rsp)) => return (filter.name(), Ok(rsp)),
                Ok(Outcome::Continue(next)) => req = next,
                Err(error) => return (filter.name(), Err(error)),
            }
        }

        (VIRTUAL, self.upstream_for(&req.cx).forward(req).await)
    }

    fn upstream_for(&self, cx: &RequestContext) -> &Upstream {
        if cx.user.is_virtual_native() {
            &self.passthrough
        } else {
            &self.privileged
        }
    }

    async fn authorize(&self, cx: &RequestContext) -> Result<(), Error> {
        let Some(rbac) = &self.rbac else {
            return Ok(());
        };
        let attrs = Attributes::new(cx.user.user.clone(), &cx.info, cx.node.clone());
        let verdict = rbac.check(&attrs).await.map_err(Error::Delegation)?;
        if verdict.is_allowed() {
            return Ok(());
        }
        Err(StatusError::forbidden(verdict.reason).into())
    }
}
