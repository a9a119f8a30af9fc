//! Gantry - an embeddable API gateway core.
//!
//! Gantry routes each incoming request to the first proxy whose rule matches
//! it, runs the proxy's interceptor chain, and dispatches the request to the
//! proxy's target. Targets are absolute URLs, URL templates, balancer pools
//! with failover, or `internal://` proxies that are processed in-process
//! without touching the network.
//!
//! # Features
//! - Rules on listening port, optional bind IP, host pattern, path (prefix or regex) and method
//! - Ordered interceptor chains with request, response and abort passes
//! - In-process dispatch to internal proxies with a bounded nesting depth
//! - Round-robin, caller-sticky and fault-aware balancing with failover
//! - Active health checking of balancer nodes
//! - Runtime administration of proxies and nodes over a JSON API
//! - Structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use gantry::{GatewayService, HttpClientAdapter, interceptors::BuiltinInterceptorFactory};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = gantry::config::load_config("gantry.yaml").await?;
//! gantry::config::ServerConfigValidator::validate(&cfg)?;
//! let gateway = GatewayService::from_config(
//!     &cfg,
//!     Arc::new(HttpClientAdapter::new()?),
//!     Arc::new(BuiltinInterceptorFactory),
//! )
//! .await?;
//! // Serve it through a ListenerSet (see the binary crate)
//! # let _ = gateway;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Ports (traits) live in `ports`, their implementations in `adapters`, and
//! the routing and dispatch logic in `core`. The core never performs I/O of
//! its own; it reaches backends only through the [`HttpClient`] port.
//!
//! # Error Handling
//! Domain operations return their own `thiserror` types. Startup and wiring
//! code returns `eyre::Result<T>` with context attached via `WrapErr`.
pub mod config;
pub mod interceptors;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{
        AdminApi, HealthChecker, HttpClientAdapter, HttpHandler, ListenerSet, Reinitializer,
    },
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
