//! Admin endpoints on a separate listener: readiness, liveness and the
//! proxy's own metrics. The main listener's `/metrics` path stays a
//! verbatim proxy of the upstream Prometheus.

use futures::future;
use http::header::CONTENT_TYPE;
use hyper::{Body, Request, Response};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument};

#[instrument(skip(registry, ready))]
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<Registry>,
    ready: watch::Receiver<bool>,
) -> Result<(), hyper::Error> {
    let server =
        hyper::Server::bind(&addr).serve(hyper::service::make_service_fn(move |_conn| {
            let registry = registry.clone();
            let ready = ready.clone();
            future::ok::<_, hyper::Error>(hyper::service::service_fn(
                move |req: Request<Body>| {
                    let rsp = match req.uri().path() {
                        "/ready" => handle_ready(&ready, &req),
                        "/live" => text_response(hyper::StatusCode::OK, "live\n"),
                        "/metrics" => handle_metrics(&registry),
                        _ => Response::builder()
                            .status(hyper::StatusCode::NOT_FOUND)
                            .body(Body::default())
                            .expect("not found response must be valid"),
                    };
                    future::ok::<_, hyper::Error>(rsp)
                },
            ))
        }));
    info!(addr = %server.local_addr(), "HTTP admin server listening");
    server.await
}

fn handle_ready(ready: &watch::Receiver<bool>, req: &Request<Body>) -> Response<Body> {
    match *req.method() {
        hyper::Method::GET | hyper::Method::HEAD => {
            if *ready.borrow() {
                text_response(hyper::StatusCode::OK, "ready\n")
            } else {
                text_response(hyper::StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
            }
        }
        _ => Response::builder()
            .status(hyper::StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::default())
            .expect("method not allowed response must be valid"),
    }
}

fn handle_metrics(registry: &Registry) -> Response<Body> {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, registry) {
        Ok(()) => Response::builder()
            .status(hyper::StatusCode::OK)
            .header(
                CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(Body::from(buf))
            .expect("metrics response must be valid"),
        Err(_) => text_response(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics\n",
        ),
    }
}

fn text_response(status: hyper::StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(body.into())
        .expect("text response must be valid")
}
