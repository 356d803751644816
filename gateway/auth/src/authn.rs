use std::sync::Arc;
use tracing::debug;
use vcluster_gateway_core::{sha256_hex, TokenAuthenticator, TokenOutcome, TtlCache, UserInfo};
use vcluster_gateway_k8s_api::Reviewer;

/// Resolves bearer tokens by delegating a TokenReview to an API server.
///
/// Successful reviews are cached by token digest; rejections and transport
/// failures are never cached.
pub struct DelegatingAuthenticator {
    reviewer: Arc<dyn Reviewer>,
    cache: TtlCache<String, UserInfo>,
}

// === impl DelegatingAuthenticator ===

impl DelegatingAuthenticator {
    pub fn new(reviewer: Arc<dyn Reviewer>) -> Self {
        Self::with_cache(reviewer, TtlCache::default())
    }

    pub fn with_cache(reviewer: Arc<dyn Reviewer>, cache: TtlCache<String, UserInfo>) -> Self {
        Self { reviewer, cache }
    }
}

#[async_trait::async_trait]
impl TokenAuthenticator for DelegatingAuthenticator {
    async fn authenticate_token(&self, token: &str) -> anyhow::Result<TokenOutcome> {
        let key = sha256_hex(token.as_bytes());
        if let Some(user) = self.cache.get(&key) {
            return Ok(TokenOutcome::Authenticated(user));
        }

        let status = self.reviewer.token_review(token).await?;
        if !status.authenticated.unwrap_or(false) {
            let reason = status
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "token not authenticated".to_string());
            debug!(%reason, "Token rejected");
            return Ok(TokenOutcome::Rejected { reason });
        }

        let user = match status.user {
            Some(user) if user.username.as_deref().is_some_and(|n| !n.is_empty()) => UserInfo {
                name: user.username.unwrap_or_default(),
                uid: user.uid.unwrap_or_default(),
                groups: user.groups.unwrap_or_default(),
                extra: user.extra.unwrap_or_default(),
            },
            _ => {
                return Ok(TokenOutcome::Rejected {
                    reason: "token review returned no user".to_string(),
                })
            }
        };

        self.cache.insert(key, user.clone());
        Ok(TokenOutcome::Authenticated(user))
    }
}
