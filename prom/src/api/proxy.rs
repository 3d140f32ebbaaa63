use http::uri::{PathAndQuery, Uri};

use super::ApiError;

/// Rebuilds a request URI against the upstream's scheme and authority,
/// keeping the caller's path and query.
pub fn upstream_uri(upstream: &Uri, path_and_query: &str) -> Result<Uri, ApiError> {
    let mut parts = upstream.clone().into_parts();
    parts.path_and_query = Some(path_and_query.parse::<PathAndQuery>().map_err(|error| {
        ApiError::Internal(format!("invalid upstream path {path_and_query:?}: {error}"))
    })?);
    Uri::from_parts(parts)
        .map_err(|error| ApiError::Internal(format!("failed to build upstream uri: {error}")))
}
