//! Bearer-token authentication through the Kubernetes `TokenReview` API.

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use kube::api::{Api, PostParams};

pub use k8s_openapi::api::authentication::v1::UserInfo;

#[derive(Debug, thiserror::Error)]
pub enum AuthenticationError {
    #[error("token review request failed: {0}")]
    Review(#[source] kube::Error),
    #[error("token review returned no status")]
    MissingStatus,
    #[error("token is not authenticated")]
    Unauthenticated,
}

/// Validates a bearer token against the cluster and returns the identity it
/// belongs to.
#[async_trait]
pub trait Authenticate {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, AuthenticationError>;
}

#[derive(Clone)]
pub struct TokenReviewer {
    client: kube::Client,
}

// === impl TokenReviewer ===

impl TokenReviewer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Authenticate for TokenReviewer {
    async fn authenticate(&self, token: &str) -> Result<UserInfo, AuthenticationError> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = Api::<TokenReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await
            .map_err(AuthenticationError::Review)?;
        let status = created.status.ok_or(AuthenticationError::MissingStatus)?;

        if status.authenticated != Some(true) {
            return Err(AuthenticationError::Unauthenticated);
        }
        Ok(status.user.unwrap_or_default())
    }
}
