//! Resolves a bearer token to the set of namespaces it may see.
//!
//! The pipeline: decode the token's claims without verifying the signature
//! (the API server vetted the token when it was issued, and the subject
//! access review below is the real authorization gate), dispatch on the
//! issuer to find the claimed namespace, confirm through a cached
//! `SubjectAccessReview` that the project-monitoring service account in
//! that namespace may view Prometheus resources, then expand to every live
//! namespace sharing the same project id.
//!
//! Every failure below the cache yields the empty set: a low-privilege
//! token sees an empty result, not a 5xx.

use async_trait::async_trait;
use jsonwebtoken::{DecodingKey, Validation};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec, SubjectAccessReviewStatus,
};
use kube::api::{Api, PostParams};
use lru::LruCache;
use parking_lot::Mutex;
use prometheus_auth_data::Set;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::index::SharedIndex;
use crate::metrics::ValidationMetrics;

const REVIEW_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const REVIEW_CACHE_CAPACITY: usize = 1024;
const PROJECT_MONITORING_SERVICE_ACCOUNT: &str = "project-monitoring";

/// Maps a bearer token to its allowed namespace set.
#[async_trait]
pub trait Namespaces {
    async fn query(&self, token: &str) -> Set;
}

/// Issues `SubjectAccessReview`s; a seam so the resolver can be exercised
/// without a cluster.
#[async_trait]
pub trait AccessReviewer {
    async fn review_access(
        &self,
        user: &str,
        namespace: &str,
    ) -> Result<SubjectAccessReviewStatus, kube::Error>;
}

#[derive(Clone)]
pub struct KubeAccessReviewer {
    client: kube::Client,
}

// === impl KubeAccessReviewer ===

impl KubeAccessReviewer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn review_access(
        &self,
        user: &str,
        namespace: &str,
    ) -> Result<SubjectAccessReviewStatus, kube::Error> {
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(namespace.to_string()),
                    verb: Some("view".to_string()),
                    group: Some("monitoring.coreos.com".to_string()),
                    resource: Some("prometheus".to_string()),
                    ..Default::default()
                }),
                user: Some(user.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = Api::<SubjectAccessReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;
        Ok(created.status.unwrap_or_default())
    }
}

pub struct NamespaceResolver<R> {
    reviewer: R,
    index: SharedIndex,
    review_cache: Mutex<LruCache<String, Instant>>,
    metrics: ValidationMetrics,
    extra_issuer: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum ResolveError {
    #[error("failed to parse bearer token claims: {0}")]
    Claims(String),
    #[error("unknown token issuer {0:?}")]
    UnknownIssuer(String),
    #[error("no namespace claim in token issued by {0:?}")]
    MissingNamespace(String),
    #[error("unknown namespace of token: {0:?}")]
    UnknownNamespace(String),
    #[error("namespace of token is being deleted: {0:?}")]
    TerminatingNamespace(String),
    #[error("unknown project of namespace {0:?}")]
    UnknownProject(String),
    #[error("access review request failed: {0}")]
    Review(#[source] kube::Error),
    #[error("token is not allowed to access namespace {0:?}")]
    Denied(String),
}

// === impl NamespaceResolver ===

impl<R> NamespaceResolver<R>
where
    R: AccessReviewer + Send + Sync,
{
    pub fn new(
        reviewer: R,
        index: SharedIndex,
        metrics: ValidationMetrics,
        extra_issuer: Option<String>,
    ) -> Self {
        Self {
            reviewer,
            index,
            review_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(REVIEW_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            metrics,
            extra_issuer,
        }
    }

    async fn resolve(&self, token: &str) -> Result<Set, ResolveError> {
        let claimed = self.validate(token).await?;

        let index = self.index.read();
        let entry = index
            .namespace(&claimed)
            .ok_or_else(|| ResolveError::UnknownNamespace(claimed.clone()))?;
        if entry.terminating {
            return Err(ResolveError::TerminatingNamespace(claimed));
        }
        let project_id = entry
            .project_id
            .clone()
            .ok_or_else(|| ResolveError::UnknownProject(claimed.clone()))?;
        Ok(index.project_members(&project_id))
    }

    /// Checks the token and returns the namespace it belongs to.
    async fn validate(&self, token: &str) -> Result<String, ResolveError> {
        let claimed = match claimed_namespace(token, self.extra_issuer.as_deref()) {
            Ok(namespace) => namespace,
            // Legacy service-account secrets hold opaque tokens that are not
            // JWTs; the secret index can still tell us where they came from.
            Err(error @ ResolveError::Claims(_)) => {
                match self.index.read().namespace_for_token(token) {
                    Some(namespace) => {
                        debug!(%namespace, "resolved opaque token through the secret index");
                        namespace
                    }
                    None => return Err(error),
                }
            }
            Err(error) => {
                self.metrics.inc_failed("");
                return Err(error);
            }
        };

        if self.cached(token) {
            debug!(namespace = %claimed, "token review cache hit");
            self.metrics.inc_successful(&claimed);
            return Ok(claimed);
        }

        let user = format!(
            "system:serviceaccount:{claimed}:{PROJECT_MONITORING_SERVICE_ACCOUNT}"
        );
        debug!(namespace = %claimed, "sending access review");
        let status = match self.reviewer.review_access(&user, &claimed).await {
            Ok(status) => status,
            Err(error) => {
                self.metrics.inc_failed(&claimed);
                return Err(ResolveError::Review(error));
            }
        };

        if status.denied == Some(true) || !status.allowed {
            self.metrics.inc_failed(&claimed);
            return Err(ResolveError::Denied(claimed));
        }

        self.insert_cached(token);
        self.metrics.inc_successful(&claimed);
        Ok(claimed)
    }

    fn cached(&self, token: &str) -> bool {
        let mut cache = self.review_cache.lock();
        match cache.get(token) {
            Some(inserted_at) if inserted_at.elapsed() < REVIEW_CACHE_TTL => true,
            Some(_) => {
                cache.pop(token);
                false
            }
            None => false,
        }
    }

    fn insert_cached(&self, token: &str) {
        self.review_cache
            .lock()
            .put(token.to_string(), Instant::now());
    }
}

#[async_trait]
impl<R> Namespaces for NamespaceResolver<R>
where
    R: AccessReviewer + Send + Sync,
{
    async fn query(&self, token: &str) -> Set {
        match self.resolve(token).await {
            Ok(namespaces) => namespaces,
            Err(error) => {
                warn!(%error, "failed to resolve namespaces for token");
                Set::default()
            }
        }
    }
}

/// The three claims the proxy consumes; everything else in the token is
/// ignored.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(rename = "kubernetes.io", default)]
    kubernetes: Option<BoundClaims>,
    #[serde(rename = "kubernetes.io/serviceaccount/namespace", default)]
    service_account_namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BoundClaims {
    #[serde(default)]
    namespace: Option<String>,
}

fn claimed_namespace(token: &str, extra_issuer: Option<&str>) -> Result<String, ResolveError> {
    let claims = decode_claims(token)?;
    let issuer = claims.iss.clone().unwrap_or_default();

    let cluster_name = std::env::var("CLUSTER_NAME").unwrap_or_default();
    let caas_issuer = format!("https://oidc.caas-{cluster_name}.telekom.de/");

    let bound = || claims.kubernetes.as_ref().and_then(|k| k.namespace.clone());
    let namespace = match issuer.as_str() {
        // bound token
        "rke" => bound(),
        // k3s
        "https://kubernetes.default.svc.cluster.local" => bound(),
        // legacy token
        "kubernetes/serviceaccount" => claims.service_account_namespace.clone(),
        issuer if issuer == caas_issuer => bound(),
        issuer if Some(issuer) == extra_issuer => bound(),
        _ => return Err(ResolveError::UnknownIssuer(issuer)),
    };

    namespace
        .filter(|namespace| !namespace.is_empty())
        .ok_or(ResolveError::MissingNamespace(issuer))
}

fn decode_claims(token: &str) -> Result<TokenClaims, ResolveError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|error| ResolveError::Claims(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::{mk_namespace, mk_token_secret};
    use crate::index::{Index, MULTI_PROJECT_KEY_LABEL, PROJECT_ID_LABEL};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mk_token(claims: serde_json::Value) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"unverified"),
        )
        .expect("encode token")
    }

    fn bound_token(issuer: &str, namespace: &str) -> String {
        mk_token(serde_json::json!({
            "iss": issuer,
            "kubernetes.io": { "namespace": namespace, "serviceaccount": { "name": "default" } },
        }))
    }

    struct FakeReviewer {
        allowed: bool,
        denied: bool,
        reviews: AtomicUsize,
    }

    impl FakeReviewer {
        fn allowing() -> Self {
            Self {
                allowed: true,
                denied: false,
                reviews: AtomicUsize::new(0),
            }
        }

        fn denying() -> Self {
            Self {
                allowed: false,
                denied: true,
                reviews: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AccessReviewer for FakeReviewer {
        async fn review_access(
            &self,
            user: &str,
            namespace: &str,
        ) -> Result<SubjectAccessReviewStatus, kube::Error> {
            assert_eq!(user, format!("system:serviceaccount:{namespace}:project-monitoring"));
            self.reviews.fetch_add(1, Ordering::SeqCst);
            Ok(SubjectAccessReviewStatus {
                allowed: self.allowed,
                denied: Some(self.denied),
                ..Default::default()
            })
        }
    }

    fn project_index() -> SharedIndex {
        let index = Index::shared();
        {
            let mut write = index.write();
            write.apply_namespace(&mk_namespace("ns-a", &[(MULTI_PROJECT_KEY_LABEL, "p-1")], false));
            write.apply_namespace(&mk_namespace("ns-b", &[(PROJECT_ID_LABEL, "p-1")], false));
            write.apply_namespace(&mk_namespace("ns-gone", &[(PROJECT_ID_LABEL, "p-1")], true));
            write.apply_namespace(&mk_namespace("ns-c", &[(PROJECT_ID_LABEL, "p-2")], false));
            write.apply_namespace(&mk_namespace("plain", &[], false));
        }
        index
    }

    fn resolver(reviewer: FakeReviewer) -> NamespaceResolver<FakeReviewer> {
        NamespaceResolver::new(reviewer, project_index(), ValidationMetrics::default(), None)
    }

    #[test]
    fn issuer_dispatch_selects_the_claim_spelling() {
        for issuer in ["rke", "https://kubernetes.default.svc.cluster.local"] {
            let token = bound_token(issuer, "ns-a");
            assert_eq!(claimed_namespace(&token, None).expect("namespace"), "ns-a");
        }

        let legacy = mk_token(serde_json::json!({
            "iss": "kubernetes/serviceaccount",
            "kubernetes.io/serviceaccount/namespace": "ns-b",
        }));
        assert_eq!(claimed_namespace(&legacy, None).expect("namespace"), "ns-b");

        let extra = bound_token("https://issuer.example.com/", "ns-c");
        assert_eq!(
            claimed_namespace(&extra, Some("https://issuer.example.com/")).expect("namespace"),
            "ns-c"
        );
    }

    #[test]
    fn cluster_name_participates_in_the_caas_issuer() {
        std::env::set_var("CLUSTER_NAME", "unit");
        let token = bound_token("https://oidc.caas-unit.telekom.de/", "ns-a");
        assert_eq!(claimed_namespace(&token, None).expect("namespace"), "ns-a");
        std::env::remove_var("CLUSTER_NAME");
    }

    #[test]
    fn unknown_issuer_is_an_explicit_error() {
        let token = bound_token("https://evil.example.com/", "ns-a");
        assert!(matches!(
            claimed_namespace(&token, None),
            Err(ResolveError::UnknownIssuer(_))
        ));
    }

    #[test]
    fn missing_namespace_claim_is_an_error() {
        let token = mk_token(serde_json::json!({ "iss": "rke" }));
        assert!(matches!(
            claimed_namespace(&token, None),
            Err(ResolveError::MissingNamespace(_))
        ));
    }

    #[test]
    fn malformed_tokens_fail_claim_decoding() {
        assert!(matches!(
            claimed_namespace("not-a-jwt", None),
            Err(ResolveError::Claims(_))
        ));
    }

    #[tokio::test]
    async fn allowed_token_expands_to_its_project() {
        let resolver = resolver(FakeReviewer::allowing());
        let namespaces = resolver.query(&bound_token("rke", "ns-a")).await;
        assert_eq!(namespaces.values().collect::<Vec<_>>(), vec!["ns-a", "ns-b"]);
    }

    #[tokio::test]
    async fn terminating_project_members_are_excluded() {
        let resolver = resolver(FakeReviewer::allowing());
        let namespaces = resolver.query(&bound_token("rke", "ns-b")).await;
        assert!(!namespaces.contains("ns-gone"));
    }

    #[tokio::test]
    async fn denied_token_yields_the_empty_set() {
        let resolver = resolver(FakeReviewer::denying());
        let namespaces = resolver.query(&bound_token("rke", "ns-a")).await;
        assert!(namespaces.is_empty());
        assert_eq!(resolver.reviewer.reviews.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_namespace_yields_the_empty_set() {
        let resolver = resolver(FakeReviewer::allowing());
        let namespaces = resolver.query(&bound_token("rke", "nowhere")).await;
        assert!(namespaces.is_empty());
    }

    #[tokio::test]
    async fn namespace_without_a_project_yields_the_empty_set() {
        let resolver = resolver(FakeReviewer::allowing());
        let namespaces = resolver.query(&bound_token("rke", "plain")).await;
        assert!(namespaces.is_empty());
    }

    #[tokio::test]
    async fn malformed_token_yields_the_empty_set() {
        let resolver = resolver(FakeReviewer::allowing());
        let namespaces = resolver.query("garbage").await;
        assert!(namespaces.is_empty());
        assert_eq!(resolver.reviewer.reviews.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_reviews_are_cached() {
        let resolver = resolver(FakeReviewer::allowing());
        let token = bound_token("rke", "ns-a");

        let first = resolver.query(&token).await;
        let second = resolver.query(&token).await;
        assert_eq!(first, second);
        assert_eq!(resolver.reviewer.reviews.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_reviews_are_not_cached() {
        let resolver = resolver(FakeReviewer::denying());
        let token = bound_token("rke", "ns-a");

        resolver.query(&token).await;
        resolver.query(&token).await;
        assert_eq!(resolver.reviewer.reviews.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn opaque_tokens_fall_back_to_the_secret_index() {
        let index = project_index();
        index
            .write()
            .apply_secret(&mk_token_secret("ns-a", "sa-token", "opaque-token"));
        let resolver = NamespaceResolver::new(
            FakeReviewer::allowing(),
            index,
            ValidationMetrics::default(),
            None,
        );

        let namespaces = resolver.query("opaque-token").await;
        assert_eq!(namespaces.values().collect::<Vec<_>>(), vec!["ns-a", "ns-b"]);
    }
}
