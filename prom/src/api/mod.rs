//! The HTTP request interceptor.
//!
//! Every request is authenticated against the cluster; the agent's own
//! identity is proxied verbatim, everything else is routed to a
//! per-endpoint handler that rewrites the query to the caller's allowed
//! namespaces before forwarding it upstream. Errors follow the Prometheus
//! envelope: `{"status":"error","errorType":…,"error":…}`.

mod federate;
mod labels;
mod proxy;
mod query;
mod read;
mod series;

use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode, Uri};
use hyper::client::HttpConnector;
use hyper::{Body, Request, Response};
use prometheus_auth_data::Set;
use prometheus_auth_k8s::{Authenticate, Namespaces, UserInfo};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task;
use tracing::{debug, error};

use crate::matcher::MatcherError;
use crate::rewrite::{rewrite_selector, RewriteError};

pub use self::proxy::upstream_uri;

pub(crate) const MATCH_PARAM: &str = "match[]";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The client sent an unparseable expression or matcher.
    #[error("{0}")]
    BadData(String),
    /// No token, a malformed token, or one the cluster rejected.
    #[error("{0}")]
    Unauthenticated(String),
    /// The request cannot be satisfied under the rewritten matchers.
    #[error("{0}")]
    Execution(String),
    /// Marshalling or I/O failure inside the proxy itself.
    #[error("{0}")]
    Internal(String),
}

// === impl ApiError ===

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadData(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Execution(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> Option<&'static str> {
        match self {
            Self::BadData(_) => Some("bad_data"),
            Self::Unauthenticated(_) => Some("unauthorized"),
            Self::Execution(_) => Some("execution"),
            Self::Internal(_) => None,
        }
    }
}

impl From<RewriteError> for ApiError {
    fn from(error: RewriteError) -> Self {
        Self::BadData(error.to_string())
    }
}

impl From<MatcherError> for ApiError {
    fn from(error: MatcherError) -> Self {
        Self::BadData(error.to_string())
    }
}

/// Configuration shared by every request.
pub struct ApiConfig {
    /// The upstream Prometheus.
    pub upstream: Uri,
    /// The agent's own identity; a matching UID bypasses all rewriting.
    pub identity: UserInfo,
    /// Label names stripped from outgoing remote-read matchers.
    pub filter_reader_labels: Set,
    /// Only rewrite `namespace`, ignoring the `exported_namespace` alias.
    pub strict_namespace_label: bool,
}

#[derive(Clone)]
pub struct ApiHandler {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    tokens: Arc<dyn Authenticate + Send + Sync>,
    namespaces: Arc<dyn Namespaces + Send + Sync>,
    upstream: Uri,
    identity: UserInfo,
    client: hyper::Client<HttpConnector, Body>,
    filter_reader_labels: Set,
    strict_namespace_label: bool,
}

// === impl ApiHandler ===

impl ApiHandler {
    pub fn new(
        config: ApiConfig,
        tokens: Arc<dyn Authenticate + Send + Sync>,
        namespaces: Arc<dyn Namespaces + Send + Sync>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tokens,
                namespaces,
                upstream: config.upstream,
                identity: config.identity,
                client: hyper::Client::builder().build_http(),
                filter_reader_labels: config.filter_reader_labels,
                strict_namespace_label: config.strict_namespace_label,
            }),
        }
    }
}

impl hyper::service::Service<Request<Body>> for ApiHandler {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let wants_json = wants_json(req.headers());
            // A panicking handler must not take the listener down with it.
            let rsp = match AssertUnwindSafe(inner.handle(req)).catch_unwind().await {
                Ok(Ok(rsp)) => rsp,
                Ok(Err(err)) => {
                    debug!(error = %err, "request failed");
                    error_response(&err, wants_json)
                }
                Err(_) => {
                    error!("request handler panicked");
                    let err = ApiError::Internal("unknown internal error".to_string());
                    error_response(&err, wants_json)
                }
            };
            Ok(rsp)
        })
    }
}

// === impl Inner ===

impl Inner {
    async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let token = bearer_token(req.headers()).ok_or_else(|| {
            ApiError::Unauthenticated("missing or malformed bearer token".to_string())
        })?;
        let user = self.tokens.authenticate(&token).await.map_err(|error| {
            debug!(%error, "failed to authenticate bearer token");
            ApiError::Unauthenticated(error.to_string())
        })?;

        // The agent's own identity is the federation escape hatch: queries
        // pass through untouched.
        if self.identity.uid.is_some() && user.uid == self.identity.uid {
            return self.proxy(req).await;
        }

        let path = req.uri().path().to_string();
        match path.as_str() {
            "/metrics" | "/-/healthy" | "/-/ready" => self.proxy(req).await,
            "/federate" => {
                let namespaces = self.namespaces.query(&token).await;
                federate::handle(self, req, namespaces).await
            }
            "/api/v1/query" | "/api/v1/query_range" => {
                let namespaces = self.namespaces.query(&token).await;
                query::handle(self, req, namespaces).await
            }
            "/api/v1/series" => {
                let namespaces = self.namespaces.query(&token).await;
                series::handle(self, req, namespaces).await
            }
            "/api/v1/labels" => {
                let namespaces = self.namespaces.query(&token).await;
                labels::handle(self, req, namespaces).await
            }
            path if path.starts_with("/api/v1/label/") && path.ends_with("/values") => {
                let namespaces = self.namespaces.query(&token).await;
                labels::handle(self, req, namespaces).await
            }
            "/api/v1/read" => {
                let namespaces = self.namespaces.query(&token).await;
                read::handle(self, req, namespaces).await
            }
            _ => Ok(not_found()),
        }
    }
}

/// A request with its query-string and form parameters decoded; the handlers
/// re-encode them after rewriting.
pub(crate) struct ApiRequest {
    pub(crate) parts: http::request::Parts,
    pub(crate) params: Vec<(String, String)>,
}

pub(crate) async fn read_request(req: Request<Body>) -> Result<ApiRequest, ApiError> {
    let (parts, body) = req.into_parts();
    let mut params: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|query| url::form_urlencoded::parse(query.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    if is_form(&parts.headers) {
        let bytes = hyper::body::to_bytes(body)
            .await
            .map_err(|error| ApiError::Internal(format!("failed to read request body: {error}")))?;
        params.extend(url::form_urlencoded::parse(&bytes).into_owned());
    }

    Ok(ApiRequest { parts, params })
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Rewrites every `match[]` series selector in the parameter list.
pub(crate) fn rewrite_match_params(
    namespaces: &Set,
    params: Vec<(String, String)>,
    strict: bool,
) -> Result<Vec<(String, String)>, ApiError> {
    params
        .into_iter()
        .map(|(key, value)| {
            if key == MATCH_PARAM {
                let rewritten = rewrite_selector(namespaces, &value, strict)?;
                Ok((key, rewritten))
            } else {
                Ok((key, value))
            }
        })
        .collect()
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("application/json"))
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(rename = "errorType", skip_serializing_if = "Option::is_none")]
    error_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `{"status":"success","data":[]}`: the valid-but-empty answer handed to
/// tokens with no namespaces, without consulting the upstream.
pub(crate) fn empty_success() -> Response<Body> {
    let envelope = Envelope {
        status: "success",
        data: Some(Vec::<String>::new()),
        error_type: None,
        error: None,
    };
    let body = serde_json::to_vec(&envelope).expect("envelope serializes");
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("success response must be valid")
}

pub(crate) fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .expect("not found response must be valid")
}

fn error_response(error: &ApiError, wants_json: bool) -> Response<Body> {
    let status = error.status();
    if !wants_json {
        return Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(Body::from(format!("{error}\n")))
            .expect("error response must be valid");
    }

    let envelope = Envelope::<()> {
        status: "error",
        data: None,
        error_type: error.error_type(),
        error: Some(error.to_string()),
    };
    let body = serde_json::to_vec(&envelope).expect("envelope serializes");
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("error response must be valid")
}

/// Hop-by-hop headers are stripped before a request is replayed upstream.
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

pub(crate) fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove(http::header::HOST);
}

pub(crate) fn copy_forward_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if HOP_HEADERS.contains(&name.as_str())
            || name == &http::header::HOST
            || name == &CONTENT_LENGTH
        {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

impl Inner {
    pub(crate) fn strict(&self) -> bool {
        self.strict_namespace_label
    }

    pub(crate) fn filter_reader_labels(&self) -> &Set {
        &self.filter_reader_labels
    }

    /// Forwards the (possibly rewritten) parameter list upstream, as a query
    /// string for GET and a form body for POST.
    pub(crate) async fn forward_params(
        &self,
        parts: &http::request::Parts,
        params: Vec<(String, String)>,
    ) -> Result<Response<Body>, ApiError> {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();

        let (path_and_query, body, is_form) = if parts.method == Method::POST {
            (parts.uri.path().to_string(), Body::from(encoded), true)
        } else {
            let path_and_query = if encoded.is_empty() {
                parts.uri.path().to_string()
            } else {
                format!("{}?{}", parts.uri.path(), encoded)
            };
            (path_and_query, Body::empty(), false)
        };

        let uri = upstream_uri(&self.upstream, &path_and_query)?;
        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        let headers = builder.headers_mut().expect("request builder has headers");
        copy_forward_headers(&parts.headers, headers);
        if is_form {
            headers.insert(
                CONTENT_TYPE,
                http::HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
        }

        let req = builder
            .body(body)
            .map_err(|error| ApiError::Internal(format!("failed to build upstream request: {error}")))?;
        self.send(req).await
    }

    /// Proxies a request upstream byte-for-byte (modulo hop headers).
    pub(crate) async fn proxy(&self, mut req: Request<Body>) -> Result<Response<Body>, ApiError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        *req.uri_mut() = upstream_uri(&self.upstream, &path_and_query)?;
        strip_hop_headers(req.headers_mut());
        self.send(req).await
    }

    pub(crate) async fn send(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
        self.client
            .request(req)
            .await
            .map_err(|error| ApiError::Internal(format!("upstream request failed: {error}")))
    }
}
