use std::{
    fmt,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::{PathMode, ProxyConfig},
    core::{
        interceptor::{InterceptorError, SharedInterceptor, order_chain},
        rule_key::{HostPattern, PathPattern, RuleKey, RuleKeyError},
        target::{Target, TargetError},
    },
    ports::interceptor_factory::InterceptorFactory,
};

/// Errors raised while building a proxy from configuration
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyBuildError {
    #[error("proxy '{proxy}': {source}")]
    RuleKey {
        proxy: String,
        #[source]
        source: RuleKeyError,
    },

    #[error("proxy '{proxy}': {source}")]
    Target {
        proxy: String,
        #[source]
        source: TargetError,
    },

    #[error("proxy '{proxy}': {source}")]
    Interceptor {
        proxy: String,
        #[source]
        source: InterceptorError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    /// Bound to a port and matched against inbound requests.
    External,
    /// Never bound; reachable only through `internal://name`.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ProxyState {
    Uninitialized,
    Active,
    /// Initialization failed; retried by the reinitializer.
    Inactive(String),
}

/// A routing rule with its interceptor chain and target.
pub struct Proxy {
    name: String,
    kind: ProxyKind,
    key: RuleKey,
    interceptors: Vec<SharedInterceptor>,
    target: Target,
    state: ArcSwap<ProxyState>,
    requests: AtomicU64,
    aborts: AtomicU64,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("interceptors", &self.interceptor_names())
            .field("target", &self.target)
            .field("state", &*self.state.load())
            .finish()
    }
}

impl Proxy {
    pub fn builder(name: impl Into<String>) -> ProxyBuilder {
        ProxyBuilder {
            name: name.into(),
            kind: ProxyKind::External,
            key: RuleKey::port(0),
            interceptors: Vec::new(),
            target: Target::None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn is_internal(&self) -> bool {
        self.kind == ProxyKind::Internal
    }

    pub fn key(&self) -> &RuleKey {
        &self.key
    }

    /// The chain, already ordered by priority.
    pub fn interceptors(&self) -> &[SharedInterceptor] {
        &self.interceptors
    }

    pub fn interceptor_names(&self) -> Vec<String> {
        self.interceptors
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> ProxyState {
        self.state.load().as_ref().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(**self.state.load(), ProxyState::Active)
    }

    /// Runs every interceptor's `init`. The first failure leaves the proxy
    /// inactive with that error; returns whether the proxy is now active.
    pub async fn init(&self) -> bool {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.init().await {
                let message = format!("{}: {}", interceptor.name(), e);
                tracing::warn!("Proxy {} stays inactive: {}", self.name, message);
                self.state.store(Arc::new(ProxyState::Inactive(message)));
                return false;
            }
        }
        self.state.store(Arc::new(ProxyState::Active));
        tracing::info!("Proxy {} is active", self.name);
        true
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            name: self.name.clone(),
            kind: self.kind,
            port: self.key.port,
            host: self.key.host.as_str().to_string(),
            path: self.key.path.as_ref().map(|p| p.as_str().to_string()),
            method: self.key.method.clone().unwrap_or_else(|| "*".to_string()),
            interceptors: self.interceptor_names(),
            target: self.target.to_string(),
            state: self.state(),
            requests: self.requests.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a proxy for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    pub kind: ProxyKind,
    pub port: u16,
    pub host: String,
    pub path: Option<String>,
    pub method: String,
    pub interceptors: Vec<String>,
    pub target: String,
    pub state: ProxyState,
    pub requests: u64,
    pub aborts: u64,
}

pub struct ProxyBuilder {
    name: String,
    kind: ProxyKind,
    key: RuleKey,
    interceptors: Vec<SharedInterceptor>,
    target: Target,
}

impl ProxyBuilder {
    pub fn internal(mut self) -> Self {
        self.kind = ProxyKind::Internal;
        self
    }

    pub fn key(mut self, key: RuleKey) -> Self {
        self.key = key;
        self
    }

    pub fn interceptor(mut self, interceptor: SharedInterceptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn build(self) -> Proxy {
        Proxy {
            name: self.name,
            kind: self.kind,
            key: self.key,
            interceptors: order_chain(self.interceptors),
            target: self.target,
            state: ArcSwap::from_pointee(ProxyState::Uninitialized),
            requests: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }
}

/// Builds proxies from configuration using an interceptor factory.
#[derive(Clone)]
pub struct ProxyFactory {
    interceptors: Arc<dyn InterceptorFactory>,
}

impl ProxyFactory {
    pub fn new(interceptors: Arc<dyn InterceptorFactory>) -> Self {
        Self { interceptors }
    }

    pub fn rule_key(config: &ProxyConfig) -> Result<RuleKey, RuleKeyError> {
        let mut key = RuleKey::port(config.port)
            .with_host(HostPattern::new(&config.host)?)
            .with_method(&config.method);
        if let Some(ip) = &config.ip {
            let ip: IpAddr = ip.parse().map_err(|_| RuleKeyError::InvalidIp(ip.clone()))?;
            key = key.with_ip(ip);
        }
        if let Some(path) = &config.path {
            key = key.with_path(match path.mode {
                PathMode::Prefix => PathPattern::prefix(&path.pattern),
                PathMode::Regex => PathPattern::regex(&path.pattern)?,
            });
        }
        Ok(key)
    }

    /// Builds an uninitialized proxy; call [`Proxy::init`] before routing to it.
    pub fn build(&self, config: &ProxyConfig) -> Result<Proxy, ProxyBuildError> {
        let key = Self::rule_key(config).map_err(|source| ProxyBuildError::RuleKey {
            proxy: config.name.clone(),
            source,
        })?;
        let target =
            Target::from_config(config.target.as_ref()).map_err(|source| ProxyBuildError::Target {
                proxy: config.name.clone(),
                source,
            })?;

        let mut builder = Proxy::builder(&config.name).key(key).target(target);
        if config.internal {
            builder = builder.internal();
        }
        for interceptor in &config.interceptors {
            let interceptor =
                self.interceptors
                    .create(interceptor)
                    .map_err(|source| ProxyBuildError::Interceptor {
                        proxy: config.name.clone(),
                        source,
                    })?;
            builder = builder.interceptor(interceptor);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::core::interceptor::{Interceptor, InterceptorResult};

    struct FailingInit;

    #[async_trait]
    impl Interceptor for FailingInit {
        fn name(&self) -> &str {
            "failing-init"
        }

        async fn init(&self) -> InterceptorResult<()> {
            Err(InterceptorError::Init("missing key file".to_string()))
        }
    }

    #[test]
    fn test_rule_key_from_config() {
        let config = ProxyConfig::external("api", 8080)
            .with_host("*.example.com")
            .with_path("^/v[0-9]+/", PathMode::Regex)
            .with_method("GET");
        let key = ProxyFactory::rule_key(&config).unwrap();
        assert_eq!(key.port, 8080);
        assert_eq!(key.method.as_deref(), Some("GET"));
        assert!(key.host.matches("api.example.com"));

        let mut bad = ProxyConfig::external("api", 8080);
        bad.ip = Some("not-an-ip".to_string());
        assert!(matches!(
            ProxyFactory::rule_key(&bad),
            Err(RuleKeyError::InvalidIp(_))
        ));
    }

    #[tokio::test]
    async fn test_init_activates() {
        let proxy = Proxy::builder("p").key(RuleKey::port(80)).build();
        assert_eq!(proxy.state(), ProxyState::Uninitialized);
        assert!(proxy.init().await);
        assert!(proxy.is_active());
    }

    #[tokio::test]
    async fn test_failed_init_leaves_proxy_inactive() {
        let proxy = Proxy::builder("p")
            .interceptor(Arc::new(FailingInit))
            .build();
        assert!(!proxy.init().await);
        match proxy.state() {
            ProxyState::Inactive(error) => assert!(error.contains("missing key file")),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_serializes_state() {
        let proxy = Proxy::builder("orders").internal().build();
        let json = serde_json::to_value(proxy.snapshot()).unwrap();
        assert_eq!(json["kind"], "internal");
        assert_eq!(json["state"]["state"], "uninitialized");
        assert_eq!(json["target"], "none");
    }
}
