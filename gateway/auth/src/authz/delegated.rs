use std::sync::Arc;
use tracing::debug;
use vcluster_gateway_core::{Attributes, TtlCache, Verdict};
use vcluster_gateway_k8s_api::{
    NonResourceAttributes, ResourceAttributes, Reviewer, SubjectAccessReviewSpec,
};

/// A SubjectAccessReview against one API server, with its own decision cache.
///
/// A review that is not allowed is a denial.
pub struct HostCheck {
    reviewer: Arc<dyn Reviewer>,
    cache: TtlCache<String, Verdict>,
}

// === impl HostCheck ===

impl HostCheck {
    pub fn new(reviewer: Arc<dyn Reviewer>) -> Self {
        Self::with_cache(reviewer, TtlCache::default())
    }

    pub fn with_cache(reviewer: Arc<dyn Reviewer>, cache: TtlCache<String, Verdict>) -> Self {
        Self { reviewer, cache }
    }

    pub async fn check(&self, attrs: &Attributes) -> anyhow::Result<Verdict> {
        let key = attrs.cache_key();
        if let Some(verdict) = self.cache.get(&key) {
            return Ok(verdict);
        }

        let status = self.reviewer.subject_access_review(review_spec(attrs)).await?;
        let verdict = if status.allowed {
            Verdict {
                reason: status.reason.unwrap_or_default(),
                ..Verdict::allow()
            }
        } else {
            let reason = status
                .reason
                .filter(|r| !r.is_empty())
                .or(status.evaluation_error)
                .unwrap_or_default();
            Verdict::deny(reason)
        };
        debug!(user = %attrs.user.name, verb = %attrs.verb, decision = ?verdict.decision, "Delegated authorization");

        self.cache.insert(key, verdict.clone());
        Ok(verdict)
    }
}

pub(crate) fn review_spec(attrs: &Attributes) -> SubjectAccessReviewSpec {
    let user = &attrs.user;
    let mut spec = SubjectAccessReviewSpec {
        user: Some(user.name.clone()),
        uid: Some(user.uid.clone()).filter(|u| !u.is_empty()),
        groups: Some(user.groups.clone()),
        extra: Some(user.extra.clone()).filter(|e| !e.is_empty()),
        ..SubjectAccessReviewSpec::default()
    };
    if attrs.resource_request {
        spec.resource_attributes = Some(ResourceAttributes {
            namespace: Some(attrs.namespace.clone()),
            verb: Some(attrs.verb.clone()),
            group: Some(attrs.api_group.clone()),
            version: Some(attrs.api_version.clone()),
            resource: Some(attrs.resource.clone()),
            subresource: Some(attrs.subresource.clone()),
            name: Some(attrs.name.clone()),
            ..ResourceAttributes::default()
        });
    } else {
        spec.non_resource_attributes = Some(NonResourceAttributes {
            path: Some(attrs.path.clone()),
            verb: Some(attrs.verb.clone()),
        });
    }
    spec
}
