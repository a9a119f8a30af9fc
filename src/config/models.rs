use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_any() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_internal_depth() -> usize {
    16
}

fn default_backend_timeout_secs() -> u64 {
    30
}

fn default_reinit_interval_secs() -> u64 {
    15
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub retries: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    /// Maximum nesting of internal dispatches before failing with 508
    #[serde(default = "default_max_internal_depth")]
    pub max_internal_depth: usize,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
    /// How often inactive proxies are re-initialized
    #[serde(default = "default_reinit_interval_secs")]
    pub reinit_interval_secs: u64,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            health_check: HealthCheckConfig::default(),
            retries: RetryConfig::default(),
            logging: LoggingConfig::default(),
            admin: None,
            max_internal_depth: default_max_internal_depth(),
            backend_timeout_secs: default_backend_timeout_secs(),
            reinit_interval_secs: default_reinit_interval_secs(),
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    proxies: Vec<ProxyConfig>,
    health_check: Option<HealthCheckConfig>,
    retries: Option<RetryConfig>,
    logging: Option<LoggingConfig>,
    admin: Option<AdminConfig>,
    max_internal_depth: Option<usize>,
    backend_timeout_secs: Option<u64>,
}

impl ServerConfigBuilder {
    /// Append a proxy; registration order is matching order
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxies.push(proxy);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    pub fn retries(mut self, config: RetryConfig) -> Self {
        self.retries = Some(config);
        self
    }

    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = Some(config);
        self
    }

    pub fn admin(mut self, listen_addr: impl Into<String>) -> Self {
        self.admin = Some(AdminConfig {
            listen_addr: listen_addr.into(),
        });
        self
    }

    pub fn max_internal_depth(mut self, depth: usize) -> Self {
        self.max_internal_depth = Some(depth);
        self
    }

    pub fn backend_timeout_secs(mut self, secs: u64) -> Self {
        self.backend_timeout_secs = Some(secs);
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.proxies.is_empty() {
            return Err("At least one proxy must be configured".to_string());
        }

        let defaults = ServerConfig::default();
        Ok(ServerConfig {
            proxies: self.proxies,
            health_check: self.health_check.unwrap_or_default(),
            retries: self.retries.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
            admin: self.admin,
            max_internal_depth: self
                .max_internal_depth
                .unwrap_or(defaults.max_internal_depth),
            backend_timeout_secs: self
                .backend_timeout_secs
                .unwrap_or(defaults.backend_timeout_secs),
            reinit_interval_secs: defaults.reinit_interval_secs,
        })
    }
}

/// One routing rule: match criteria, interceptor chain and target.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProxyConfig {
    pub name: String,
    /// Internal proxies never bind a port and are reached via `internal://name`
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: u16,
    /// Whitespace separated host alternatives, `*` as wildcard
    #[serde(default = "default_any")]
    pub host: String,
    #[serde(default)]
    pub path: Option<PathConfig>,
    #[serde(default = "default_any")]
    pub method: String,
    #[serde(default)]
    pub interceptors: Vec<InterceptorConfig>,
    #[serde(default)]
    pub target: Option<TargetConfig>,
}

impl ProxyConfig {
    /// An external proxy matching anything on `port`
    pub fn external(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            internal: false,
            ip: None,
            port,
            host: default_any(),
            path: None,
            method: default_any(),
            interceptors: Vec::new(),
            target: None,
        }
    }

    pub fn internal(name: impl Into<String>) -> Self {
        Self {
            internal: true,
            ..Self::external(name, 0)
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_path(mut self, pattern: impl Into<String>, mode: PathMode) -> Self {
        self.path = Some(PathConfig {
            pattern: pattern.into(),
            mode,
        });
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_interceptor(mut self, interceptor: InterceptorConfig) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.target = Some(target);
        self
    }

    /// Shorthand for a `url` target
    pub fn with_url(self, url: impl Into<String>) -> Self {
        self.with_target(TargetConfig::Url { url: url.into() })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PathConfig {
    pub pattern: String,
    #[serde(default)]
    pub mode: PathMode,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathMode {
    #[default]
    Prefix,
    Regex,
}

/// Where a proxy sends requests that pass its request flow.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum TargetConfig {
    /// Absolute URL, `${...}` template or `internal://name[/path]`
    Url { url: String },
    Host { host: String, port: u16 },
    Balancer(BalancerConfig),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BalancerConfig {
    pub name: String,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    pub nodes: Vec<NodeConfig>,
    /// Append the remaining nodes as failover destinations
    #[serde(default = "default_true")]
    pub failover: bool,
    #[serde(default)]
    pub fault_monitoring: FaultMonitoringConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub health_url: Option<String>,
}

impl NodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            health_url: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    ByCaller,
    FaultMonitoring,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FaultMonitoringConfig {
    /// Share of flawless candidates at or above which round robin is used
    pub min_flawless_ratio: f64,
    /// Seconds without failure after which a fault profile is forgotten
    pub clear_after_secs: u64,
    /// Consecutive failures that take a node DOWN, 0 disables
    pub max_failures: u32,
}

impl Default for FaultMonitoringConfig {
    fn default() -> Self {
        Self {
            min_flawless_ratio: 0.5,
            clear_after_secs: 300,
            max_failures: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first call
    pub retries: usize,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Treat 5xx responses like connection failures
    pub failover_on_5xx: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            delay_ms: 10,
            backoff_multiplier: 2.0,
            failover_on_5xx: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AdminConfig {
    pub listen_addr: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct HeaderActions {
    #[serde(default)]
    pub add: HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

fn default_request_id_header() -> String {
    "X-Request-ID".to_string()
}

fn default_static_status() -> u16 {
    200
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// Built-in interceptors, selected by `type`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum InterceptorConfig {
    RequestId {
        #[serde(default = "default_request_id_header")]
        header: String,
    },
    Headers {
        #[serde(default)]
        request: HeaderActions,
        #[serde(default)]
        response: HeaderActions,
    },
    AccessLog,
    StaticResponse {
        #[serde(default = "default_static_status")]
        status: u16,
        #[serde(default)]
        body: String,
        #[serde(default = "default_content_type")]
        content_type: String,
    },
    RateLimit(RateLimitConfig),
    SetProperty {
        name: String,
        value: serde_json::Value,
    },
}

fn default_status_code() -> u16 {
    429
}

fn default_message() -> String {
    "Too Many Requests".to_string()
}

/// Rate limiting discriminator for how keys are derived.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    Ip,
    Header,
    Route,
}

/// Behaviour when a key could not be extracted (missing IP/header etc.).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    Allow,
    Deny,
}

fn default_on_missing_key() -> MissingKeyPolicy {
    MissingKeyPolicy::Allow
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub by: RateLimitBy,
    #[serde(default)]
    pub header_name: Option<String>, // Should be Some if by == Header
    pub requests: u64,
    pub period: String, // Parsed by humantime, e.g., "1s", "5m", "1h"
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_on_missing_key")]
    pub on_missing_key: MissingKeyPolicy,
}
