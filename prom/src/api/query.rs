//! `/api/v1/query` and `/api/v1/query_range`: the `query` parameter is
//! parsed as a full PromQL expression and every vector selector in the AST
//! is restricted to the caller's namespaces.

use hyper::{Body, Request, Response};
use prometheus_auth_data::Set;

use super::{read_request, ApiError, Inner};
use crate::rewrite::rewrite_expression;

pub(crate) async fn handle(
    inner: &Inner,
    req: Request<Body>,
    namespaces: Set,
) -> Result<Response<Body>, ApiError> {
    let request = read_request(req).await?;
    let params = request
        .params
        .into_iter()
        .map(|(key, value)| {
            if key == "query" {
                let rewritten = rewrite_expression(&namespaces, &value, inner.strict())?;
                Ok((key, rewritten))
            } else {
                Ok((key, value))
            }
        })
        .collect::<Result<Vec<_>, ApiError>>()?;
    inner.forward_params(&request.parts, params).await
}
