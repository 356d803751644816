//! The authorization chain.
//!
//! The chain only grants capabilities specific to the gateway. The virtual
//! API server's own RBAC remains the primary gate, so the chain ends in
//! [`AllowAll`] rather than denying by default. Requests the gateway answers
//! itself never reach that primary gate; see [`VirtualRbac`].

mod delegated;
mod delegating;
mod gate;
mod impersonation;
mod kubelet;
pub mod rules;


pub use self::{
    delegated::HostCheck,
    delegating::DelegatingAuthorizer,
    gate::VirtualRbac,
    impersonation::ImpersonationAuthorizer,
    kubelet::KubeletAuthorizer,
    rules::Rule,
};
use std::sync::Arc;
use tracing::trace;
use vcluster_gateway_core::{Attributes, Authorizer, Decision, Verdict};

/// Terminal authorizer of the chain.
#[derive(Clone, Debug, Default)]
pub struct AllowAll(());

/// Evaluates authorizers in order and stops at the first one with an opinion.
#[derive(Clone, Default)]
pub struct Union {
    authorizers: Vec<Arc<dyn Authorizer>>,
}

/// The outcome of a [`Union`] along with the authorizer that decided it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decided {
    pub verdict: Verdict,
    pub authorizer: &'static str,
}

// === impl AllowAll ===

impl AllowAll {
    pub const NAME: &'static str = "allow-all";

    pub fn new() -> Self {
        Self(())
    }
}

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn authorize(&self, _: &Attributes) -> anyhow::Result<Verdict> {
        Ok(Verdict::allow())
    }
}

// === impl Union ===

impl Union {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gateway's chain: kubelet, delegating, impersonation, allow-all.
    pub fn standard(
        kubelet: KubeletAuthorizer,
        delegating: DelegatingAuthorizer,
        impersonation: ImpersonationAuthorizer,
    ) -> Self {
        Self::new()
            .push(kubelet)
            .push(delegating)
            .push(impersonation)
            .push(AllowAll::new())
    }

    pub fn push(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizers.push(Arc::new(authorizer));
        self
    }

    /// Delegation failures abort evaluation; a later authorizer never
    /// overrides an earlier one that could not be consulted.
    pub async fn decide(&self, attrs: &Attributes) -> anyhow::Result<Decided> {
        for authz in &self.authorizers {
            let verdict = authz.authorize(attrs).await?;
            trace!(authorizer = authz.name(), ?verdict.decision);
            if verdict.decision != Decision::NoOpinion {
                return Ok(Decided {
                    verdict,
                    authorizer: authz.name(),
                });
            }
        }
        Ok(Decided {
            verdict: Verdict::no_opinion(),
            authorizer: "",
        })
    }
}

#[async_trait::async_trait]
impl Authorizer for Union {
    fn name(&self) -> &'static str {
        "union"
    }

    async fn authorize(&self, attrs: &Attributes) -> anyhow::Result<Verdict> {
        self.decide(attrs).await.map(|d| d.verdict)
    }
}

// === impl Decided ===

impl Decided {
    /// Whether the request was let through only by the terminal fallback.
    pub fn by_fallback(&self) -> bool {
        self.verdict.is_allowed() && self.authorizer == AllowAll::NAME
    }
}
