//! Builds and runs the proxy: Kubernetes clients, watch tasks, the API and
//! gRPC services, the admin server, and the multiplexed listener with
//! drain-based graceful shutdown.

use crate::{admin, grpc::GrpcProxy, mux};
use anyhow::{ensure, Context, Result};
use http::Uri;
use prometheus_auth_data::Set;
use prometheus_auth_k8s as k8s;
use prometheus_auth_k8s::Authenticate;
use prometheus_auth_prom::api::{ApiConfig, ApiHandler};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, info_span, Instrument};

pub struct Config {
    pub listen_address: SocketAddr,
    pub admin_address: SocketAddr,
    pub upstream: Uri,
    pub read_timeout: Duration,
    pub max_connections: usize,
    pub filter_reader_labels: Set,
    pub oidc_issuer: Option<String>,
    pub strict_namespace_label: bool,
}

pub struct Agent {
    listener: TcpListener,
    api: ApiHandler,
    grpc: GrpcProxy,
    registry: Arc<Registry>,
    admin_address: SocketAddr,
    read_timeout: Duration,
    max_connections: usize,
}

// === impl Agent ===

impl Agent {
    pub async fn new(config: Config) -> Result<Self> {
        let token = std::fs::read_to_string(k8s::SERVICE_ACCOUNT_TOKEN_PATH)
            .with_context(|| format!("failed to read token file {}", k8s::SERVICE_ACCOUNT_TOKEN_PATH))?;
        let token = token.trim().to_string();
        ensure!(
            !token.is_empty(),
            "read an empty token from {}",
            k8s::SERVICE_ACCOUNT_TOKEN_PATH
        );

        let client = kube::Client::try_default()
            .await
            .context("failed to create the Kubernetes client")?;

        let mut registry = Registry::default();
        let metrics = k8s::ValidationMetrics::register(&mut registry);

        let index = k8s::Index::shared();
        tokio::spawn(
            k8s::watch_namespaces(index.clone(), client.clone())
                .instrument(info_span!("namespaces")),
        );
        tokio::spawn(
            k8s::watch_secrets(index.clone(), client.clone()).instrument(info_span!("secrets")),
        );

        let tokens = Arc::new(k8s::TokenReviewer::new(client.clone()));
        let identity = tokens
            .authenticate(&token)
            .await
            .context("failed to authenticate the agent's own token")?;
        info!(
            username = identity.username.as_deref().unwrap_or_default(),
            "authenticated agent identity"
        );

        let resolver = Arc::new(k8s::NamespaceResolver::new(
            k8s::KubeAccessReviewer::new(client),
            index,
            metrics,
            config.oidc_issuer.clone(),
        ));

        let api = ApiHandler::new(
            ApiConfig {
                upstream: config.upstream.clone(),
                identity,
                filter_reader_labels: config.filter_reader_labels.clone(),
                strict_namespace_label: config.strict_namespace_label,
            },
            tokens.clone(),
            resolver,
        );
        let grpc = GrpcProxy::new(tokens, config.upstream.clone());

        let listener = TcpListener::bind(config.listen_address)
            .await
            .with_context(|| format!("failed to listen on {}", config.listen_address))?;

        info!(
            listen = %config.listen_address,
            admin = %config.admin_address,
            upstream = %config.upstream,
            max_connections = config.max_connections,
            read_timeout = ?config.read_timeout,
            filter_reader_labels = %config.filter_reader_labels,
            "starting agent"
        );

        Ok(Self {
            listener,
            api,
            grpc,
            registry: Arc::new(registry),
            admin_address: config.admin_address,
            read_timeout: config.read_timeout,
            max_connections: config.max_connections,
        })
    }

    pub async fn run(self) -> Result<()> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let admin = admin::serve(self.admin_address, self.registry.clone(), ready_rx);
        tokio::spawn(async move {
            if let Err(error) = admin.await {
                error!(%error, "admin server failed");
            }
        });

        let (close, drain_watch) = drain::channel();
        let served = tokio::spawn(mux::serve(
            self.listener,
            self.api,
            self.grpc,
            self.max_connections,
            self.read_timeout,
            drain_watch,
        ));
        let _ = ready_tx.send(true);

        shutdown_signal().await;
        info!("received shutdown signal; draining connections");
        close.drain().await;
        served.await.context("listener task panicked")??;
        Ok(())
    }
}

async fn shutdown_signal() {
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
