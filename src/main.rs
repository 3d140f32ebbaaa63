#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use http::Uri;
use prometheus_auth::agent::{Agent, Config};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(
    name = "prometheus-auth",
    about = "Deploys in front of Prometheus to intercept and rewrite the query APIs",
    version
)]
struct Args {
    /// Log as JSON.
    #[clap(long = "log.json")]
    log_json: bool,

    /// Log debug info.
    #[clap(long = "log.debug")]
    log_debug: bool,

    /// Address to listen on.
    #[clap(long, default_value = "0.0.0.0:9090")]
    listen_address: SocketAddr,

    /// Address for the admin endpoints (readiness and the proxy's own
    /// metrics).
    #[clap(long, default_value = "0.0.0.0:6060")]
    admin_address: SocketAddr,

    /// URL of the upstream Prometheus to proxy.
    #[clap(long)]
    proxy_url: Uri,

    /// Maximum duration before timing out the read of a request.
    #[clap(long, default_value = "5m", value_parser = humantime::parse_duration)]
    read_timeout: Duration,

    /// Maximum number of simultaneous connections.
    #[clap(long, default_value_t = 512)]
    max_connections: usize,

    /// Label names to strip from outgoing '/api/v1/read' matchers.
    #[clap(long = "filter-reader-labels")]
    filter_reader_labels: Vec<String>,

    /// Additional recognized token issuer URL.
    #[clap(long)]
    oidc_issuer: Option<String>,

    /// Only rewrite the `namespace` label, ignoring the
    /// `exported_namespace` alias.
    #[clap(long)]
    strict_namespace_label: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json, args.log_debug);

    let agent = Agent::new(Config {
        listen_address: args.listen_address,
        admin_address: args.admin_address,
        upstream: args.proxy_url,
        read_timeout: args.read_timeout,
        max_connections: args.max_connections,
        filter_reader_labels: args.filter_reader_labels.into_iter().collect(),
        oidc_issuer: args.oidc_issuer,
        strict_namespace_label: args.strict_namespace_label,
    })
    .await?;
    agent.run().await
}

fn init_tracing(json: bool, debug: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" }));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}
