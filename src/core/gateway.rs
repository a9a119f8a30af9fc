//! Core gateway orchestration service.
//!
//! `GatewayService` ties the proxy registry, the interceptor flow and the
//! outbound `HttpClient` port together. It provides:
//! * Rule matching and the request/response/abort traversal per exchange
//! * Target resolution, including in-process dispatch to internal proxies
//! * Load-balanced backend calls with retries and failover
//! * The administrative operations exposed by the admin API
//!
//! The service performs no transport I/O itself; adapters hand it an
//! [`Exchange`] and write back whatever response it ends up carrying.
use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use http::Method;
use thiserror::Error;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    config::{NodeConfig, ProxyConfig, RetryConfig, ServerConfig, ServerConfigValidator},
    core::{
        backend::{Node, NodeStatus},
        exchange::{Exchange, ExchangeFault},
        flow::FlowController,
        interceptor::Outcome,
        load_balancer::{Balancer, BalancerSnapshot, NodeOutcome},
        problem::ProblemDetails,
        proxy::{Proxy, ProxyBuildError, ProxyFactory, ProxySnapshot},
        registry::{ProxyRegistry, RegistryError},
        target::{InternalTarget, Resolution},
    },
    ports::{
        http_client::{HttpClient, HttpClientError},
        interceptor_factory::InterceptorFactory,
    },
    tracing_setup::{create_backend_span, create_request_span},
};

/// Errors returned by administrative operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdminError {
    #[error("Unknown proxy '{0}'")]
    UnknownProxy(String),

    #[error("Unknown balancer '{0}'")]
    UnknownBalancer(String),

    #[error("Unknown node {host}:{port} in balancer '{balancer}'")]
    UnknownNode {
        balancer: String,
        host: String,
        port: u16,
    },

    #[error("Node {host}:{port} already exists in balancer '{balancer}'")]
    NodeExists {
        balancer: String,
        host: String,
        port: u16,
    },

    #[error("Invalid proxy configuration: {0}")]
    InvalidProxy(String),

    #[error("No listener for proxy '{proxy}': {message}")]
    Listener { proxy: String, message: String },

    #[error(transparent)]
    Build(#[from] ProxyBuildError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Knobs for backend dispatch.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retries: RetryConfig,
    pub max_internal_depth: usize,
    pub backend_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl DispatchSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            retries: config.retries.clone(),
            max_internal_depth: config.max_internal_depth,
            backend_timeout: Duration::from_secs(config.backend_timeout_secs),
        }
    }
}

/// Central orchestrator for rule matching, interceptor flow and dispatch.
pub struct GatewayService {
    registry: Arc<ProxyRegistry>,
    http_client: Arc<dyn HttpClient>,
    proxy_factory: ProxyFactory,
    settings: DispatchSettings,
}

impl GatewayService {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        http_client: Arc<dyn HttpClient>,
        proxy_factory: ProxyFactory,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            http_client,
            proxy_factory,
            settings,
        }
    }

    /// Builds and initializes every configured proxy. Proxies whose
    /// interceptors fail to initialize are registered inactive.
    pub async fn from_config(
        config: &ServerConfig,
        http_client: Arc<dyn HttpClient>,
        interceptors: Arc<dyn InterceptorFactory>,
    ) -> eyre::Result<Self> {
        use eyre::WrapErr;

        let proxy_factory = ProxyFactory::new(interceptors);
        let mut proxies = Vec::with_capacity(config.proxies.len());
        for proxy_config in &config.proxies {
            let proxy = proxy_factory
                .build(proxy_config)
                .wrap_err("Failed to build proxy from configuration")?;
            proxy.init().await;
            proxies.push(Arc::new(proxy));
        }
        let registry =
            ProxyRegistry::with_proxies(proxies).wrap_err("Failed to register proxies")?;

        tracing::info!(
            "Gateway initialized with {} proxies ({} inactive)",
            registry.len(),
            registry.inactive().len()
        );
        Ok(Self::new(
            Arc::new(registry),
            http_client,
            proxy_factory,
            DispatchSettings::from_config(config),
        ))
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn http_client(&self) -> &Arc<dyn HttpClient> {
        &self.http_client
    }

    /// Routes one inbound exchange. The returned exchange always carries a
    /// response: the backend's, an interceptor's, or problem details.
    pub async fn handle(&self, mut exchange: Exchange) -> Exchange {
        let span = create_request_span(
            exchange.request.method.as_str(),
            exchange.request.path(),
            exchange.id(),
        );

        async {
            match self.registry.find_matching(&exchange.request_key()) {
                Some(proxy) => {
                    tracing::debug!("Matched proxy {}", proxy.name());
                    tracing::Span::current().record("proxy", proxy.name());
                    self.process(&mut exchange, proxy).await;
                }
                None => {
                    tracing::debug!(
                        "No proxy for {} {} (host '{}', port {})",
                        exchange.request.method,
                        exchange.request.uri,
                        exchange.request.host(),
                        exchange.bind_port
                    );
                    let problem = ProblemDetails::not_found()
                        .detail(format!(
                            "{} {}",
                            exchange.request.method, exchange.request.uri
                        ))
                        .instance(exchange.id());
                    exchange.set_response(problem.into_response());
                }
            }

            let span = tracing::Span::current();
            if let Some(response) = &exchange.response {
                span.record("http.status_code", response.status.as_u16());
            }
            span.record("duration_ms", exchange.elapsed().as_millis() as u64);
        }
        .instrument(span)
        .await;

        exchange
    }

    /// Runs `proxy`'s chain and target for an exchange. Internal dispatch
    /// re-enters here, hence the boxed future.
    pub fn process<'a>(
        &'a self,
        exchange: &'a mut Exchange,
        proxy: Arc<Proxy>,
    ) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            exchange.assign_proxy(Arc::clone(&proxy));
            proxy.record_request();
            let chain = proxy.interceptors();

            let outcome = match FlowController::invoke_request_handlers(exchange, chain).await {
                Outcome::Continue => match self.dispatch(exchange, &proxy).await {
                    Ok(()) => FlowController::invoke_response_handlers(exchange, chain).await,
                    Err(fault) => {
                        tracing::warn!(
                            "Proxy {} aborting exchange {}: {}",
                            proxy.name(),
                            exchange.id(),
                            fault
                        );
                        exchange.set_fault(fault);
                        let end = exchange.chain_end();
                        FlowController::invoke_abort_handlers(exchange, chain, end).await;
                        Outcome::Abort
                    }
                },
                other => other,
            };

            if outcome == Outcome::Abort {
                proxy.record_abort();
                Self::ensure_error_response(exchange);
            } else if exchange.response.is_none() {
                tracing::warn!(
                    "Proxy {} finished exchange {} without a response",
                    proxy.name(),
                    exchange.id()
                );
                exchange.set_response(
                    ProblemDetails::internal("no response was produced")
                        .instance(exchange.id())
                        .into_response(),
                );
            }
            outcome
        })
    }

    /// Keeps an error response an interceptor or inner proxy already set,
    /// otherwise renders the recorded fault.
    fn ensure_error_response(exchange: &mut Exchange) {
        let keep = exchange
            .response
            .as_ref()
            .is_some_and(|r| r.status.is_client_error() || r.status.is_server_error());
        if keep {
            return;
        }

        let problem = match exchange.fault() {
            Some(fault) => ProblemDetails::from_fault(fault),
            None => ProblemDetails::internal("the request was aborted"),
        };
        let response = problem.instance(exchange.id()).into_response();
        exchange.set_response(response);
    }

    async fn dispatch(&self, exchange: &mut Exchange, proxy: &Proxy) -> Result<(), ExchangeFault> {
        let resolution = proxy
            .target()
            .resolve(exchange)
            .map_err(|e| ExchangeFault::Resolution(e.to_string()))?;

        exchange.destinations.clear();
        match resolution {
            Resolution::Url(url) => {
                exchange.destinations.push(url);
                self.call_backend(exchange, &[], None).await
            }
            Resolution::Internal(target) => self.dispatch_internal(exchange, &target).await,
            Resolution::Pool(balancer) => self.dispatch_to_pool(exchange, &balancer).await,
        }
    }

    async fn dispatch_internal(
        &self,
        exchange: &mut Exchange,
        target: &InternalTarget,
    ) -> Result<(), ExchangeFault> {
        exchange.destinations.push(target.to_string());
        if exchange.depth() >= self.settings.max_internal_depth {
            return Err(ExchangeFault::LoopDetected {
                proxy: target.name().to_string(),
                depth: self.settings.max_internal_depth,
            });
        }

        let inner_proxy = self
            .registry
            .get_internal(target.name())
            .ok_or_else(|| ExchangeFault::UnknownInternal(target.name().to_string()))?;
        let mut inner = exchange.derive_internal(target.rewrite(&exchange.request.uri));
        tracing::debug!(
            "Exchange {} entering internal proxy {} at depth {}",
            exchange.id(),
            target.name(),
            inner.depth()
        );

        let outcome = self.process(&mut inner, inner_proxy).await;
        exchange.absorb_internal(inner);
        match outcome {
            Outcome::Abort => Err(ExchangeFault::InternalAbort {
                proxy: target.name().to_string(),
            }),
            Outcome::Continue | Outcome::Return => Ok(()),
        }
    }

    async fn dispatch_to_pool(
        &self,
        exchange: &mut Exchange,
        balancer: &Balancer,
    ) -> Result<(), ExchangeFault> {
        let primary = balancer
            .dispatch(exchange)
            .await
            .map_err(|e| ExchangeFault::Unavailable(e.to_string()))?;
        let nodes = balancer.failover_order(&primary);
        exchange.destinations = nodes
            .iter()
            .map(|n| n.destination(&exchange.request.uri))
            .collect();
        exchange.set_dispatched_node(primary);

        self.call_backend(exchange, &nodes, Some(balancer)).await
    }

    /// Calls `exchange.destinations` in turn until one answers or the retry
    /// budget is spent. `nodes[i]` is the pool node behind destination `i`.
    async fn call_backend(
        &self,
        exchange: &mut Exchange,
        nodes: &[Arc<Node>],
        balancer: Option<&Balancer>,
    ) -> Result<(), ExchangeFault> {
        let retry = &self.settings.retries;
        let count = exchange.destinations.len();
        if count == 0 {
            return Err(ExchangeFault::Resolution("no destination".to_string()));
        }

        let mut delay = Duration::from_millis(retry.delay_ms);
        let mut attempt = 0;
        loop {
            let idx = attempt % count;
            let destination = exchange.destinations[idx].clone();
            let node = nodes.get(idx);
            let last_attempt = attempt >= retry.retries;
            tracing::debug!("Calling {} (attempt {})", destination, attempt + 1);

            let span = create_backend_span(
                &destination,
                exchange.request.method.as_str(),
                attempt + 1,
            );
            if let Some(node) = node {
                node.dispatched();
            }
            let result = match timeout(
                self.settings.backend_timeout,
                self.http_client.send(&exchange.request, &destination),
            )
            .instrument(span)
            .await
            {
                Ok(result) => result,
                Err(_) => Err(HttpClientError::Timeout(
                    self.settings.backend_timeout.as_secs(),
                )),
            };
            if let Some(node) = node {
                node.completed();
            }

            match result {
                Ok(response) => {
                    let status = response.status;
                    if let (Some(node), Some(balancer)) = (node, balancer) {
                        let outcome = if status.is_server_error() {
                            NodeOutcome::ServerError(status.as_u16())
                        } else {
                            NodeOutcome::Success(status.as_u16())
                        };
                        balancer.done(node, outcome).await;
                        exchange.set_dispatched_node(Arc::clone(node));
                    }
                    exchange.set_response(response);
                    if !(status.is_server_error() && retry.failover_on_5xx) || last_attempt {
                        return Ok(());
                    }
                    tracing::warn!("{} answered {}, failing over", destination, status);
                }
                Err(e) => {
                    if let (Some(node), Some(balancer)) = (node, balancer) {
                        balancer.done(node, NodeOutcome::Failure).await;
                    }
                    let timed_out = matches!(e, HttpClientError::Timeout(_));
                    if last_attempt || !Self::should_retry(&e, &exchange.request.method, count) {
                        tracing::warn!(
                            "Giving up on {} after {} attempts: {}",
                            destination,
                            attempt + 1,
                            e
                        );
                        exchange.response = None;
                        return Err(ExchangeFault::Backend {
                            destination,
                            message: e.to_string(),
                            timed_out,
                        });
                    }
                    tracing::warn!("Call to {} failed, retrying: {}", destination, e);
                }
            }

            attempt += 1;
            if exchange.destinations[attempt % count] == destination {
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(retry.backoff_multiplier.max(1.0));
            }
        }
    }

    /// Connection failures are always retried. Timeouts only move on to
    /// another destination, and never for POST or PATCH.
    fn should_retry(error: &HttpClientError, method: &Method, destinations: usize) -> bool {
        match error {
            HttpClientError::ConnectionError(_) => true,
            HttpClientError::Timeout(_) => {
                destinations > 1 && *method != Method::POST && *method != Method::PATCH
            }
            _ => false,
        }
    }

    pub fn proxy_snapshots(&self) -> Vec<ProxySnapshot> {
        self.registry.proxies().iter().map(|p| p.snapshot()).collect()
    }

    /// Validates, builds, initializes and registers a proxy at runtime.
    pub async fn add_proxy(&self, config: &ProxyConfig) -> Result<ProxySnapshot, AdminError> {
        let errors = ServerConfigValidator::validate_proxy(config);
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(AdminError::InvalidProxy(messages.join("; ")));
        }

        let proxy = Arc::new(self.proxy_factory.build(config)?);
        proxy.init().await;
        self.registry.add(Arc::clone(&proxy))?;
        Ok(proxy.snapshot())
    }

    pub fn remove_proxy(&self, name: &str) -> Result<(), AdminError> {
        self.registry
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AdminError::UnknownProxy(name.to_string()))
    }

    pub fn balancer_snapshots(&self) -> Vec<BalancerSnapshot> {
        self.registry
            .balancers()
            .iter()
            .map(|b| b.snapshot())
            .collect()
    }

    fn find_balancer(&self, name: &str) -> Result<Arc<Balancer>, AdminError> {
        self.registry
            .balancer(name)
            .ok_or_else(|| AdminError::UnknownBalancer(name.to_string()))
    }

    pub fn set_node_status(
        &self,
        balancer: &str,
        host: &str,
        port: u16,
        status: NodeStatus,
    ) -> Result<(), AdminError> {
        if self.find_balancer(balancer)?.set_node_status(host, port, status) {
            Ok(())
        } else {
            Err(AdminError::UnknownNode {
                balancer: balancer.to_string(),
                host: host.to_string(),
                port,
            })
        }
    }

    pub fn add_node(&self, balancer: &str, node: &NodeConfig) -> Result<(), AdminError> {
        let mut new_node = Node::new(&node.host, node.port);
        if let Some(url) = &node.health_url {
            new_node = new_node.with_health_url(url);
        }
        if self.find_balancer(balancer)?.add_node(new_node) {
            Ok(())
        } else {
            Err(AdminError::NodeExists {
                balancer: balancer.to_string(),
                host: node.host.clone(),
                port: node.port,
            })
        }
    }

    pub fn remove_node(&self, balancer: &str, host: &str, port: u16) -> Result<(), AdminError> {
        if self.find_balancer(balancer)?.remove_node(host, port) {
            Ok(())
        } else {
            Err(AdminError::UnknownNode {
                balancer: balancer.to_string(),
                host: host.to_string(),
                port,
            })
        }
    }

    /// Retries `init` on every proxy that is not active; returns how many
    /// came up.
    pub async fn reinitialize_inactive(&self) -> usize {
        let mut activated = 0;
        for proxy in self.registry.inactive() {
            if proxy.init().await {
                activated += 1;
            }
        }
        activated
    }
}
