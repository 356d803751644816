use super::{rules::Rule, HostCheck};
use vcluster_gateway_core::{Attributes, Authorizer, Verdict};

/// Delegates requests matching an allow-list to the host cluster.
pub struct DelegatingAuthorizer {
    rules: Vec<Rule>,
    host: HostCheck,
}

impl DelegatingAuthorizer {
    pub fn new(rules: Vec<Rule>, host: HostCheck) -> Self {
        Self { rules, host }
    }
}

#[async_trait::async_trait]
impl Authorizer for DelegatingAuthorizer {
    fn name(&self) -> &'static str {
        "delegating"
    }

    async fn authorize(&self, attrs: &Attributes) -> anyhow::Result<Verdict> {
        if !self.rules.iter().any(|r| r.matches(attrs)) {
            return Ok(Verdict::no_opinion());
        }
        self.host.check(attrs).await
    }
}
