use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
};

use tracing_subscriber::EnvFilter;

use crate::{
    config::models::{
        BalancerConfig, HealthCheckConfig, InterceptorConfig, PathMode, ProxyConfig,
        RateLimitBy, RateLimitConfig, ServerConfig, TargetConfig,
    },
    core::{
        rule_key::{HostPattern, PathPattern},
        target::Target,
    },
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Proxy conflict detected: {message}")]
    ProxyConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ValidationError {
    fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Server configuration validator
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.proxies.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "proxies".to_string(),
            });
        }
        for proxy in &config.proxies {
            errors.extend(Self::validate_proxy(proxy));
        }
        errors.extend(Self::check_proxy_conflicts(&config.proxies));
        errors.extend(Self::check_internal_references(&config.proxies));
        errors.extend(Self::validate_health_check_config(&config.health_check));

        if config.max_internal_depth == 0 {
            errors.push(ValidationError::field(
                "max_internal_depth",
                "Must be greater than 0",
            ));
        }
        if config.backend_timeout_secs == 0 {
            errors.push(ValidationError::field(
                "backend_timeout_secs",
                "Must be greater than 0",
            ));
        }
        if config.reinit_interval_secs == 0 {
            errors.push(ValidationError::field(
                "reinit_interval_secs",
                "Must be greater than 0",
            ));
        }
        if config.retries.backoff_multiplier < 1.0 {
            errors.push(ValidationError::field(
                "retries.backoff_multiplier",
                "Must be at least 1.0",
            ));
        }
        if let Err(e) = EnvFilter::try_new(&config.logging.level) {
            errors.push(ValidationError::field(
                "logging.level",
                format!("Invalid filter directive: {e}"),
            ));
        }
        if let Some(admin) = &config.admin {
            if let Err(e) = Self::validate_listen_address(&admin.listen_addr) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Checks one proxy on its own. Used for the whole file at startup and
    /// for proxies added through the admin API.
    pub fn validate_proxy(config: &ProxyConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let name = &config.name;

        if name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "proxy name".to_string(),
            });
        }
        if !config.internal && config.port == 0 {
            errors.push(ValidationError::field(
                format!("proxy '{name}' port"),
                "External proxies must listen on a port greater than 0",
            ));
        }
        if let Some(ip) = &config.ip {
            if ip.parse::<IpAddr>().is_err() {
                errors.push(ValidationError::field(
                    format!("proxy '{name}' ip"),
                    format!("'{ip}' is not an IP address"),
                ));
            }
        }
        if let Err(e) = HostPattern::new(&config.host) {
            errors.push(ValidationError::field(
                format!("proxy '{name}' host"),
                e.to_string(),
            ));
        }
        if let Some(path) = &config.path {
            match path.mode {
                PathMode::Prefix if !path.pattern.starts_with('/') => {
                    errors.push(ValidationError::field(
                        format!("proxy '{name}' path"),
                        "Path prefixes must start with '/'",
                    ));
                }
                PathMode::Regex => {
                    if let Err(e) = PathPattern::regex(&path.pattern) {
                        errors.push(ValidationError::field(
                            format!("proxy '{name}' path"),
                            e.to_string(),
                        ));
                    }
                }
                PathMode::Prefix => {}
            }
        }
        if config.method.trim().is_empty() {
            errors.push(ValidationError::field(
                format!("proxy '{name}' method"),
                "Use '*' to match any method",
            ));
        }

        if let Some(target) = &config.target {
            errors.extend(Self::validate_target(name, target));
        }
        for interceptor in &config.interceptors {
            if let Err(e) = Self::validate_interceptor(name, interceptor) {
                errors.push(e);
            }
        }

        errors
    }

    fn validate_target(proxy: &str, target: &TargetConfig) -> Vec<ValidationError> {
        let field = format!("proxy '{proxy}' target");
        match target {
            TargetConfig::Url { url } => {
                if let Err(e) = Target::parse(url) {
                    return vec![ValidationError::field(field, e.to_string())];
                }
                match Self::static_scheme(url) {
                    Some(scheme) if scheme != "http" && scheme != "https" => {
                        vec![ValidationError::field(
                            field,
                            format!("URL scheme must be 'http' or 'https', got '{scheme}'"),
                        )]
                    }
                    _ => Vec::new(),
                }
            }
            TargetConfig::Host { host, port } => {
                let mut errors = Vec::new();
                if host.trim().is_empty() {
                    errors.push(ValidationError::field(&field, "Host cannot be empty"));
                }
                if *port == 0 {
                    errors.push(ValidationError::field(&field, "Port must be greater than 0"));
                }
                errors
            }
            TargetConfig::Balancer(balancer) => Self::validate_balancer(proxy, balancer),
        }
    }

    /// Scheme of a literal external URL; templates and internal
    /// references are checked when they resolve.
    fn static_scheme(url: &str) -> Option<String> {
        match Target::parse(url).ok()? {
            Target::Static(_) => url::Url::parse(url.trim()).ok().map(|u| u.scheme().to_string()),
            _ => None,
        }
    }

    fn validate_balancer(proxy: &str, balancer: &BalancerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = format!("proxy '{proxy}' balancer '{}'", balancer.name);

        if balancer.name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("proxy '{proxy}' balancer name"),
            });
        }
        if balancer.nodes.is_empty() {
            errors.push(ValidationError::field(
                format!("{field} nodes"),
                "Balancers must have at least one node",
            ));
        }

        let mut seen = HashSet::new();
        for node in &balancer.nodes {
            if node.host.trim().is_empty() || node.port == 0 {
                errors.push(ValidationError::field(
                    format!("{field} nodes"),
                    format!("Invalid node '{}:{}'", node.host, node.port),
                ));
            }
            if !seen.insert((node.host.as_str(), node.port)) {
                errors.push(ValidationError::field(
                    format!("{field} nodes"),
                    format!("Node '{}:{}' is listed twice", node.host, node.port),
                ));
            }
        }

        let ratio = balancer.fault_monitoring.min_flawless_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            errors.push(ValidationError::field(
                format!("{field} fault_monitoring.min_flawless_ratio"),
                format!("Must be between 0 and 1, got {ratio}"),
            ));
        }

        errors
    }

    fn validate_interceptor(proxy: &str, config: &InterceptorConfig) -> ValidationResult<()> {
        match config {
            InterceptorConfig::RequestId { header } => {
                if http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                    return Err(ValidationError::field(
                        format!("proxy '{proxy}' request_id.header"),
                        format!("'{header}' is not a valid header name"),
                    ));
                }
            }
            InterceptorConfig::StaticResponse { status, .. } => {
                if http::StatusCode::from_u16(*status).is_err() {
                    return Err(ValidationError::field(
                        format!("proxy '{proxy}' static_response.status"),
                        format!("{status} is not a valid status code"),
                    ));
                }
            }
            InterceptorConfig::SetProperty { name, .. } => {
                if name.trim().is_empty() {
                    return Err(ValidationError::MissingField {
                        field: format!("proxy '{proxy}' set_property.name"),
                    });
                }
            }
            InterceptorConfig::RateLimit(rate_limit) => {
                Self::validate_rate_limit(proxy, rate_limit)?;
            }
            InterceptorConfig::Headers { .. } | InterceptorConfig::AccessLog => {}
        }
        Ok(())
    }

    /// Validate rate limit configuration
    fn validate_rate_limit(proxy: &str, config: &RateLimitConfig) -> ValidationResult<()> {
        if config.requests == 0 {
            return Err(ValidationError::field(
                format!("proxy '{proxy}' rate_limit.requests"),
                "Rate limit requests must be greater than 0",
            ));
        }
        if u32::try_from(config.requests).is_err() {
            return Err(ValidationError::field(
                format!("proxy '{proxy}' rate_limit.requests"),
                format!("Must not exceed {}", u32::MAX),
            ));
        }

        match humantime::parse_duration(&config.period) {
            Ok(period) if period.is_zero() => {
                return Err(ValidationError::field(
                    format!("proxy '{proxy}' rate_limit.period"),
                    "Period must be greater than 0",
                ));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(ValidationError::field(
                    format!("proxy '{proxy}' rate_limit.period"),
                    format!("Period must be a duration like '1s', '5m' or '1h': {e}"),
                ));
            }
        }

        if config.by == RateLimitBy::Header
            && config.header_name.as_deref().is_none_or(|h| h.trim().is_empty())
        {
            return Err(ValidationError::MissingField {
                field: format!("proxy '{proxy}' rate_limit.header_name"),
            });
        }

        if http::StatusCode::from_u16(config.status_code).is_err() {
            return Err(ValidationError::field(
                format!("proxy '{proxy}' rate_limit.status_code"),
                format!("{} is not a valid status code", config.status_code),
            ));
        }

        Ok(())
    }

    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:9000')".to_string(),
            });
        }
        Ok(())
    }

    fn validate_health_check_config(config: &HealthCheckConfig) -> Vec<ValidationError> {
        if !config.enabled {
            return Vec::new();
        }

        let mut errors = Vec::new();
        let positive = [
            ("health_check.interval_secs", config.interval_secs),
            ("health_check.timeout_secs", config.timeout_secs),
            (
                "health_check.unhealthy_threshold",
                u64::from(config.unhealthy_threshold),
            ),
            (
                "health_check.healthy_threshold",
                u64::from(config.healthy_threshold),
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                errors.push(ValidationError::field(
                    field,
                    "Must be greater than 0 when health checks are enabled",
                ));
            }
        }

        if config.path.trim().is_empty() {
            errors.push(ValidationError::field(
                "health_check.path",
                "Cannot be empty when health checks are enabled",
            ));
        } else if !config.path.starts_with('/') {
            errors.push(ValidationError::field(
                "health_check.path",
                "Must start with '/' when health checks are enabled",
            ));
        }

        errors
    }

    /// Proxy names must be unique, and so must balancer names since the
    /// admin API addresses balancers by name.
    fn check_proxy_conflicts(proxies: &[ProxyConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut names: HashMap<&str, usize> = HashMap::new();
        let mut balancers: HashMap<&str, &str> = HashMap::new();

        for proxy in proxies {
            let count = names.entry(proxy.name.as_str()).or_default();
            *count += 1;
            if *count == 2 {
                errors.push(ValidationError::ProxyConflict {
                    message: format!("Proxy name '{}' is used more than once", proxy.name),
                });
            }

            if let Some(TargetConfig::Balancer(balancer)) = &proxy.target {
                if let Some(owner) = balancers.insert(&balancer.name, &proxy.name) {
                    errors.push(ValidationError::ProxyConflict {
                        message: format!(
                            "Balancer '{}' is declared by both '{}' and '{}'",
                            balancer.name, owner, proxy.name
                        ),
                    });
                }
            }
        }

        errors
    }

    /// Literal `internal://name` targets must name an internal proxy.
    fn check_internal_references(proxies: &[ProxyConfig]) -> Vec<ValidationError> {
        let internal: HashSet<&str> = proxies
            .iter()
            .filter(|p| p.internal)
            .map(|p| p.name.as_str())
            .collect();

        proxies
            .iter()
            .filter_map(|proxy| {
                let TargetConfig::Url { url } = proxy.target.as_ref()? else {
                    return None;
                };
                let target = Target::parse(url).ok()?;
                let name = target.internal_name()?;
                (!internal.contains(name)).then(|| {
                    ValidationError::field(
                        format!("proxy '{}' target", proxy.name),
                        format!("No internal proxy named '{name}'"),
                    )
                })
            })
            .collect()
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{NodeConfig, PathMode};

    fn minimal_valid_config() -> ServerConfig {
        ServerConfig::builder()
            .proxy(ProxyConfig::external("api", 8080).with_url("http://localhost:3000"))
            .build()
            .unwrap()
    }

    fn balancer(name: &str, nodes: Vec<NodeConfig>) -> TargetConfig {
        TargetConfig::Balancer(BalancerConfig {
            name: name.to_string(),
            strategy: Default::default(),
            nodes,
            failover: true,
            fault_monitoring: Default::default(),
        })
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ServerConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_empty_proxy_list() {
        assert!(ServerConfigValidator::validate(&ServerConfig::default()).is_err());
    }

    #[test]
    fn validate_rejects_zero_health_check_interval_when_enabled() {
        let mut config = minimal_valid_config();
        config.health_check.interval_secs = 0;

        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_invalid_health_check_path_when_enabled() {
        let mut config = minimal_valid_config();
        config.health_check.path = "health".to_string();

        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_ignores_health_check_when_disabled() {
        let mut config = minimal_valid_config();
        config.health_check.enabled = false;
        config.health_check.interval_secs = 0;

        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_proxy_reports_every_problem() {
        let mut proxy = ProxyConfig::external("bad", 0)
            .with_path("([", PathMode::Regex)
            .with_url("ftp://files.example.com");
        proxy.ip = Some("localhost".to_string());

        let errors = ServerConfigValidator::validate_proxy(&proxy);
        assert_eq!(errors.len(), 4, "{errors:?}");
    }

    #[test]
    fn validate_proxy_accepts_internal_without_port() {
        let proxy = ProxyConfig::internal("orders").with_url("http://orders:8080");
        assert!(ServerConfigValidator::validate_proxy(&proxy).is_empty());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let config = ServerConfig::builder()
            .proxy(ProxyConfig::external("api", 8080).with_url("http://a:1"))
            .proxy(ProxyConfig::external("api", 8081).with_url("http://b:1"))
            .build()
            .unwrap();

        let err = ServerConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn validate_rejects_unknown_internal_reference() {
        let config = ServerConfig::builder()
            .proxy(ProxyConfig::external("api", 8080).with_url("internal://missing/path"))
            .build()
            .unwrap();
        assert!(ServerConfigValidator::validate(&config).is_err());

        let config = ServerConfig::builder()
            .proxy(ProxyConfig::external("api", 8080).with_url("internal://orders/v1"))
            .proxy(ProxyConfig::internal("orders").with_url("http://orders:8080"))
            .build()
            .unwrap();
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_templates_skip_reference_check() {
        let config = ServerConfig::builder()
            .proxy(ProxyConfig::external("api", 8080).with_url("internal://${header.X-Svc}"))
            .build()
            .unwrap();
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_balancer_rules() {
        let proxy = ProxyConfig::external("lb", 8080).with_target(balancer("pool", vec![]));
        assert_eq!(ServerConfigValidator::validate_proxy(&proxy).len(), 1);

        let proxy = ProxyConfig::external("lb", 8080).with_target(balancer(
            "pool",
            vec![NodeConfig::new("a", 80), NodeConfig::new("a", 80)],
        ));
        assert_eq!(ServerConfigValidator::validate_proxy(&proxy).len(), 1);

        let config = ServerConfig::builder()
            .proxy(
                ProxyConfig::external("one", 8080)
                    .with_target(balancer("pool", vec![NodeConfig::new("a", 80)])),
            )
            .proxy(
                ProxyConfig::external("two", 8081)
                    .with_target(balancer("pool", vec![NodeConfig::new("b", 80)])),
            )
            .build()
            .unwrap();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rate_limit_period_and_header() {
        let limit = |by: RateLimitBy, period: &str| RateLimitConfig {
            by,
            header_name: None,
            requests: 10,
            period: period.to_string(),
            status_code: 429,
            message: "slow down".to_string(),
            on_missing_key: crate::config::MissingKeyPolicy::Allow,
        };

        assert!(ServerConfigValidator::validate_rate_limit("p", &limit(RateLimitBy::Ip, "1s")).is_ok());
        assert!(
            ServerConfigValidator::validate_rate_limit("p", &limit(RateLimitBy::Route, "500ms"))
                .is_ok()
        );
        assert!(
            ServerConfigValidator::validate_rate_limit("p", &limit(RateLimitBy::Ip, "soon")).is_err()
        );
        assert!(
            ServerConfigValidator::validate_rate_limit("p", &limit(RateLimitBy::Header, "1m"))
                .is_err()
        );
    }

    #[test]
    fn validate_rejects_zero_depth_and_bad_log_level() {
        let mut config = minimal_valid_config();
        config.max_internal_depth = 0;
        assert!(ServerConfigValidator::validate(&config).is_err());

        let mut config = minimal_valid_config();
        config.logging.level = "gantry=loud".to_string();
        assert!(ServerConfigValidator::validate(&config).is_err());
    }
}
