//! Splits a single listen port between HTTP/1.1 API traffic and HTTP/2
//! gRPC streams.
//!
//! Each accepted connection is sniffed for the HTTP/2 client preface and
//! served on its own task; a semaphore caps the number of concurrent
//! connections before either side sees them. The read timeout applies to
//! the HTTP side only.

use crate::grpc::GrpcProxy;
use crate::transport::{sniff_h2_preface, Prefixed};
use anyhow::Result;
use hyper::server::conn::Http;
use prometheus_auth_prom::api::ApiHandler;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info};

pub async fn serve(
    listener: TcpListener,
    api: ApiHandler,
    grpc: GrpcProxy,
    max_connections: usize,
    read_timeout: Duration,
    watch: drain::Watch,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(max_connections));
    info!(addr = %listener.local_addr()?, "listening for connections");

    loop {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let (stream, _peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    debug!(%error, "failed to accept connection");
                    continue;
                }
            },
            _ = watch.clone().signaled() => {
                info!("shutdown signaled; no longer accepting connections");
                return Ok(());
            }
        };

        let api = api.clone();
        let grpc = grpc.clone();
        let watch = watch.clone();
        tokio::spawn(async move {
            let _permit = permit;
            serve_connection(stream, api, grpc, read_timeout, watch).await;
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    api: ApiHandler,
    grpc: GrpcProxy,
    read_timeout: Duration,
    watch: drain::Watch,
) {
    let peer = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);

    let (is_h2, sniffed) = match sniff_h2_preface(&mut stream).await {
        Ok(sniffed) => sniffed,
        Err(error) => {
            debug!(?peer, %error, "failed to read connection preface");
            return;
        }
    };
    let io = Prefixed::new(sniffed.freeze(), stream);

    if is_h2 {
        let conn = Http::new().http2_only(true).serve_connection(io, grpc);
        tokio::pin!(conn);
        tokio::select! {
            result = &mut conn => {
                if let Err(error) = result {
                    debug!(?peer, %error, "gRPC connection closed");
                }
            }
            handle = watch.signaled() => {
                conn.as_mut().graceful_shutdown();
                if let Err(error) = handle.release_after(conn).await {
                    debug!(?peer, %error, "gRPC connection failed during shutdown");
                }
            }
        }
    } else {
        let mut http = Http::new();
        http.http1_header_read_timeout(read_timeout);
        let conn = http.serve_connection(io, api);
        tokio::pin!(conn);
        tokio::select! {
            result = &mut conn => {
                if let Err(error) = result {
                    debug!(?peer, %error, "connection closed");
                }
            }
            handle = watch.signaled() => {
                conn.as_mut().graceful_shutdown();
                if let Err(error) = handle.release_after(conn).await {
                    debug!(?peer, %error, "connection failed during shutdown");
                }
            }
        }
    }
}
