//! `/api/v1/labels` and `/api/v1/label/{name}/values`.
//!
//! A caller with no namespaces gets the empty success envelope straight
//! from the proxy; the upstream is never consulted. Otherwise any
//! user-supplied `match[]` selectors are refined, and a namespace-only
//! selector is appended when none were supplied (appending alongside a
//! user selector would widen the result).

use hyper::{Body, Request, Response};
use prometheus_auth_data::Set;

use super::{empty_success, read_request, rewrite_match_params, ApiError, Inner, MATCH_PARAM};
use crate::matcher::NONE_NAMESPACE;

pub(crate) async fn handle(
    inner: &Inner,
    req: Request<Body>,
    namespaces: Set,
) -> Result<Response<Body>, ApiError> {
    if namespaces.is_empty() {
        return Ok(empty_success());
    }

    let request = read_request(req).await?;
    let mut params = rewrite_match_params(&namespaces, request.params, inner.strict())?;
    if !params.iter().any(|(key, _)| key == MATCH_PARAM) {
        params.push((MATCH_PARAM.to_string(), namespace_selector(&namespaces)));
    }
    inner.forward_params(&request.parts, params).await
}

fn namespace_selector(namespaces: &Set) -> String {
    let mut values = namespaces.values();
    match namespaces.len() {
        0 => format!("{{namespace=\"{NONE_NAMESPACE}\"}}"),
        1 => format!(
            "{{namespace=\"{}\"}}",
            values.next().expect("length checked")
        ),
        _ => format!("{{namespace=~\"{}\"}}", namespaces.join("|")),
    }
}
