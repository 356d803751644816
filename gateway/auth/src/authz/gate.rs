use super::HostCheck;
use std::sync::Arc;
use vcluster_gateway_core::{Attributes, Decision, Verdict};
use vcluster_gateway_k8s_api::Reviewer;

/// RBAC of the virtual cluster, consulted for requests that the gateway
/// answers itself and that were admitted only by the chain's fallback.
pub struct VirtualRbac {
    check: HostCheck,
}

impl VirtualRbac {
    pub fn new(reviewer: Arc<dyn Reviewer>) -> Self {
        Self {
            check: HostCheck::new(reviewer),
        }
    }

    pub async fn check(&self, attrs: &Attributes) -> anyhow::Result<Verdict> {
        let verdict = self.check.check(attrs).await?;
        if verdict.decision == Decision::Allow {
            return Ok(verdict);
        }
        let reason = if verdict.reason.is_empty() {
            format!("{attrs}")
        } else {
            format!("{attrs}: {}", verdict.reason)
        };
        Ok(Verdict::deny(reason))
    }
}
