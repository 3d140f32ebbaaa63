//! `/federate`: every `match[]` vector selector is restricted to the
//! caller's namespaces; the exposition body streams back untouched.

use hyper::{Body, Request, Response};
use prometheus_auth_data::Set;

use super::{read_request, rewrite_match_params, ApiError, Inner};

pub(crate) async fn handle(
    inner: &Inner,
    req: Request<Body>,
    namespaces: Set,
) -> Result<Response<Body>, ApiError> {
    let request = read_request(req).await?;
    let params = rewrite_match_params(&namespaces, request.params, inner.strict())?;
    inner.forward_params(&request.parts, params).await
}
