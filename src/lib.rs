//! An authenticating multi-tenant reverse proxy for Prometheus.
//!
//! The proxy accepts metric queries from holders of Kubernetes
//! service-account bearer tokens and rewrites them so every caller only
//! sees time series belonging to namespaces of the Kubernetes project the
//! token is authorized to view. One listen port serves both HTTP/1.1 and
//! HTTP/2 gRPC traffic; the agent's own cluster-admin identity is proxied
//! verbatim.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod admin;
pub mod agent;
pub mod grpc;
pub mod mux;
mod transport;
