use k8s_openapi::api::{
    authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus},
    authorization::v1::{SubjectAccessReview, SubjectAccessReviewSpec, SubjectAccessReviewStatus},
};
use kube::api::{Api, PostParams};

/// Delegates authentication and authorization decisions to an API server.
#[async_trait::async_trait]
pub trait Reviewer: Send + Sync {
    async fn token_review(&self, token: &str) -> kube::Result<TokenReviewStatus>;

    async fn subject_access_review(
        &self,
        spec: SubjectAccessReviewSpec,
    ) -> kube::Result<SubjectAccessReviewStatus>;
}

#[async_trait::async_trait]
impl Reviewer for kube::Client {
    async fn token_review(&self, token: &str) -> kube::Result<TokenReviewStatus> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..TokenReviewSpec::default()
            },
            ..TokenReview::default()
        };
        let review = Api::<TokenReview>::all(self.clone())
            .create(&PostParams::default(), &review)
            .await?;
        Ok(review.status.unwrap_or_default())
    }

    async fn subject_access_review(
        &self,
        spec: SubjectAccessReviewSpec,
    ) -> kube::Result<SubjectAccessReviewStatus> {
        let review = SubjectAccessReview {
            spec,
            ..SubjectAccessReview::default()
        };
        let review = Api::<SubjectAccessReview>::all(self.clone())
            .create(&PostParams::default(), &review)
            .await?;
        Ok(review.status.unwrap_or_default())
    }
}
