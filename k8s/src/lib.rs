//! Kubernetes-facing half of the proxy: token authentication, the
//! token-to-namespace resolver, and the watch-backed cluster indexes both
//! consume.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod metrics;
mod namespaces;
mod tokens;

pub use self::index::{watch_namespaces, watch_secrets, Index, SharedIndex};
pub use self::metrics::ValidationMetrics;
pub use self::namespaces::{
    AccessReviewer, KubeAccessReviewer, NamespaceResolver, Namespaces,
};
pub use self::tokens::{Authenticate, AuthenticationError, TokenReviewer, UserInfo};

/// Where the agent's own service-account token is mounted in-cluster.
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";
