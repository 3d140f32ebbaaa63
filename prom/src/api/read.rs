//! `/api/v1/read`: the snappy-framed protobuf `ReadRequest` is decoded,
//! each inner query's matchers are restricted to the caller's namespaces
//! (after dropping the operator-configured reader filter labels), and the
//! request is re-encoded. The upstream `ReadResponse` passes through
//! unmodified.

use http::header::CONTENT_TYPE;
use hyper::{Body, Request, Response};
use prometheus_auth_data::Set;
use prost::Message;

use super::{copy_forward_headers, upstream_uri, ApiError, Inner};
use crate::matcher::filter_label_matchers;
use crate::prompb::ReadRequest;

pub(crate) async fn handle(
    inner: &Inner,
    req: Request<Body>,
    namespaces: Set,
) -> Result<Response<Body>, ApiError> {
    let (parts, body) = req.into_parts();
    let compressed = hyper::body::to_bytes(body)
        .await
        .map_err(|error| ApiError::Internal(format!("failed to read request body: {error}")))?;
    let raw = snap::raw::Decoder::new()
        .decompress_vec(&compressed)
        .map_err(|error| ApiError::Execution(format!("failed to decode snappy body: {error}")))?;
    let mut read_request = ReadRequest::decode(raw.as_slice())
        .map_err(|error| ApiError::Execution(format!("failed to decode read request: {error}")))?;

    for query in read_request.queries.iter_mut() {
        let mut matchers = std::mem::take(&mut query.matchers);
        matchers.retain(|matcher| !inner.filter_reader_labels().contains(&matcher.name));
        query.matchers = filter_label_matchers(&namespaces, matchers)?;
    }

    let mut encoded = Vec::with_capacity(read_request.encoded_len());
    read_request
        .encode(&mut encoded)
        .map_err(|error| ApiError::Internal(format!("failed to encode read request: {error}")))?;
    let body = snap::raw::Encoder::new()
        .compress_vec(&encoded)
        .map_err(|error| ApiError::Internal(format!("failed to encode snappy body: {error}")))?;

    let uri = upstream_uri(
        &inner.upstream,
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/api/v1/read"),
    )?;
    let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
    let headers = builder.headers_mut().expect("request builder has headers");
    copy_forward_headers(&parts.headers, headers);
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(
            CONTENT_TYPE,
            http::HeaderValue::from_static("application/x-protobuf"),
        );
    }

    let req = builder
        .body(Body::from(body))
        .map_err(|error| ApiError::Internal(format!("failed to build upstream request: {error}")))?;
    inner.send(req).await
}
