use super::HostCheck;
use vcluster_gateway_core::{Attributes, Authorizer, Verdict};

/// Whether a user may impersonate another identity is decided by the host.
pub struct ImpersonationAuthorizer {
    host: HostCheck,
}

impl ImpersonationAuthorizer {
    pub fn new(host: HostCheck) -> Self {
        Self { host }
    }
}

#[async_trait::async_trait]
impl Authorizer for ImpersonationAuthorizer {
    fn name(&self) -> &'static str {
        "impersonation"
    }

    async fn authorize(&self, attrs: &Attributes) -> anyhow::Result<Verdict> {
        if !attrs.resource_request || attrs.verb != "impersonate" {
            return Ok(Verdict::no_opinion());
        }
        self.host.check(attrs).await
    }
}
