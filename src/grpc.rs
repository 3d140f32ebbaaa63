//! Transparent gRPC passthrough.
//!
//! Streams are never parsed: authentication happens at stream
//! establishment from the `authorization` metadata (or the dedicated
//! remote-read token entry) and the HTTP/2 exchange is then forwarded
//! wholesale to the upstream. Failures answer with a headers-only gRPC
//! status frame.

use futures::future::BoxFuture;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, StatusCode, Uri};
use hyper::client::HttpConnector;
use hyper::{Body, Request, Response};
use prometheus_auth_k8s::Authenticate;
use prometheus_auth_prom::api::upstream_uri;
use std::sync::Arc;
use std::task;
use tracing::{debug, warn};

/// gRPC metadata entry carrying the bearer for remote-read streams.
const REMOTE_READ_TOKEN_HEADER: &str = "x-prom-remote-read-token";

const GRPC_STATUS_UNAUTHENTICATED: &str = "16";
const GRPC_STATUS_UNAVAILABLE: &str = "14";

#[derive(Clone)]
pub struct GrpcProxy {
    inner: Arc<Inner>,
}

struct Inner {
    tokens: Arc<dyn Authenticate + Send + Sync>,
    upstream: Uri,
    client: hyper::Client<HttpConnector, Body>,
}

// === impl GrpcProxy ===

impl GrpcProxy {
    pub fn new(tokens: Arc<dyn Authenticate + Send + Sync>, upstream: Uri) -> Self {
        Self {
            inner: Arc::new(Inner {
                tokens,
                upstream,
                client: hyper::Client::builder().http2_only(true).build_http(),
            }),
        }
    }
}

impl hyper::service::Service<Request<Body>> for GrpcProxy {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.proxy(req).await) })
    }
}

// === impl Inner ===

impl Inner {
    async fn proxy(&self, mut req: Request<Body>) -> Response<Body> {
        let Some(token) = bearer_metadata(req.headers()) else {
            return status_response(GRPC_STATUS_UNAUTHENTICATED, "missing bearer token");
        };
        if let Err(error) = self.tokens.authenticate(&token).await {
            debug!(%error, "failed to authenticate gRPC stream");
            return status_response(GRPC_STATUS_UNAUTHENTICATED, "invalid bearer token");
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        match upstream_uri(&self.upstream, &path_and_query) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(error) => {
                warn!(%error, "failed to address upstream gRPC endpoint");
                return status_response(GRPC_STATUS_UNAVAILABLE, "upstream unavailable");
            }
        }
        req.headers_mut().remove(http::header::HOST);

        match self.client.request(req).await {
            Ok(rsp) => rsp,
            Err(error) => {
                warn!(%error, "failed to reach upstream gRPC endpoint");
                status_response(GRPC_STATUS_UNAVAILABLE, "upstream unavailable")
            }
        }
    }
}

fn bearer_metadata(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get(REMOTE_READ_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

/// A headers-only gRPC frame: HTTP 200 with the outcome carried in
/// `grpc-status` and `grpc-message`.
fn status_response(code: &'static str, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/grpc")
        .header("grpc-status", code)
        .header("grpc-message", message)
        .body(Body::empty())
        .expect("grpc status response must be valid")
}
