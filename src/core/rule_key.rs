use std::net::IpAddr;

use regex::Regex;
use thiserror::Error;

/// Errors raised while compiling a rule key
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RuleKeyError {
    #[error("Invalid host pattern '{pattern}': {source}")]
    InvalidHostPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid path regex '{pattern}': {source}")]
    InvalidPathRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid bind IP '{0}'")]
    InvalidIp(String),
}

pub type RuleKeyResult<T> = Result<T, RuleKeyError>;

/// Inputs an inbound request offers for rule matching.
#[derive(Debug, Clone, Copy)]
pub struct RequestKey<'a> {
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub method: &'a str,
    /// Raw Host header, possibly with a `:port` suffix.
    pub host: &'a str,
    pub path: &'a str,
}

/// Whitespace separated host alternatives where `*` stands for one or more
/// characters. Compiled once into an anchored case-insensitive regex.
#[derive(Debug, Clone)]
pub struct HostPattern {
    raw: String,
    compiled: Option<Regex>,
}

impl HostPattern {
    pub fn new(pattern: &str) -> RuleKeyResult<Self> {
        let raw = pattern.trim().to_string();
        if raw.is_empty() || raw == "*" {
            return Ok(Self::any());
        }

        let alternatives: Vec<String> = raw
            .split_whitespace()
            .map(|alt| {
                alt.split('*')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".+")
            })
            .collect();
        let expr = format!("(?i)^(?:{})$", alternatives.join("|"));
        let compiled = Regex::new(&expr).map_err(|source| RuleKeyError::InvalidHostPattern {
            pattern: raw.clone(),
            source,
        })?;

        Ok(Self {
            raw,
            compiled: Some(compiled),
        })
    }

    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            compiled: None,
        }
    }

    pub fn is_any(&self) -> bool {
        self.compiled.is_none()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Matches a Host header value; any port suffix is ignored.
    pub fn matches(&self, host_header: &str) -> bool {
        match &self.compiled {
            None => true,
            Some(regex) => regex.is_match(strip_port(host_header.trim())),
        }
    }
}

/// Removes a trailing `:port`, leaving bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rfind(':') {
        Some(idx) if !host[..idx].contains(':') => &host[..idx],
        _ => host,
    }
}

#[derive(Debug, Clone)]
pub enum PathPattern {
    Prefix(String),
    /// Unanchored search anywhere in the path.
    Regex(Regex),
}

impl PathPattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> RuleKeyResult<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|source| RuleKeyError::InvalidPathRegex {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Prefix(prefix) => path.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(path),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Prefix(prefix) => prefix,
            Self::Regex(regex) => regex.as_str(),
        }
    }
}

/// Match criteria of a proxy.
#[derive(Debug, Clone)]
pub struct RuleKey {
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub host: HostPattern,
    /// `None` matches every method.
    pub method: Option<String>,
    /// `None` matches every path.
    pub path: Option<PathPattern>,
}

impl RuleKey {
    /// A key matching any request on `port`.
    pub fn port(port: u16) -> Self {
        Self {
            ip: None,
            port,
            host: HostPattern::any(),
            method: None,
            path: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_host(mut self, host: HostPattern) -> Self {
        self.host = host;
        self
    }

    /// `*` resets to any method.
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = (method != "*").then(|| method.to_string());
        self
    }

    pub fn with_path(mut self, path: PathPattern) -> Self {
        self.path = Some(path);
        self
    }

    pub fn matches(&self, key: &RequestKey<'_>) -> bool {
        if self.port != key.port {
            return false;
        }
        if let Some(ip) = self.ip {
            if key.ip != Some(ip) {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if method != key.method {
                return false;
            }
        }
        if !self.host.matches(key.host) {
            return false;
        }
        self.path.as_ref().is_none_or(|path| path.matches(key.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key<'a>(host: &'a str, path: &'a str) -> RequestKey<'a> {
        RequestKey {
            ip: None,
            port: 8080,
            method: "GET",
            host,
            path,
        }
    }

    #[test]
    fn test_host_alternatives_and_wildcards() {
        let pattern = HostPattern::new("predic8.de *.predic8.de").unwrap();
        assert!(pattern.matches("predic8.de"));
        assert!(pattern.matches("api.predic8.de"));
        assert!(pattern.matches("API.Predic8.DE"));
        assert!(!pattern.matches("notpredic8.de"));
        assert!(!pattern.matches("predic8.de.evil.com"));
    }

    #[test]
    fn test_host_star_matches_everything() {
        let pattern = HostPattern::new("*").unwrap();
        assert!(pattern.is_any());
        assert!(pattern.matches(""));
        assert!(pattern.matches("anything.example"));
    }

    #[test]
    fn test_host_port_is_ignored() {
        let pattern = HostPattern::new("localhost").unwrap();
        assert!(pattern.matches("localhost:8080"));
        assert!(pattern.matches("LOCALHOST"));

        let pattern = HostPattern::new("[::1]").unwrap();
        assert!(pattern.matches("[::1]:9000"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[2001:db8::1]:443"), "[2001:db8::1]");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_path_prefix_and_regex() {
        let rule = RuleKey::port(8080).with_path(PathPattern::prefix("/api"));
        assert!(rule.matches(&key("h", "/api/users")));
        assert!(!rule.matches(&key("h", "/web")));

        let rule = RuleKey::port(8080).with_path(PathPattern::regex(r"/v\d+/").unwrap());
        assert!(rule.matches(&key("h", "/api/v2/users")));
        assert!(!rule.matches(&key("h", "/api/vx/users")));
    }

    #[test]
    fn test_port_ip_and_method() {
        let rule = RuleKey::port(8080)
            .with_ip("127.0.0.1".parse().unwrap())
            .with_method("POST");

        let mut request = key("h", "/");
        assert!(!rule.matches(&request));

        request.method = "POST";
        assert!(!rule.matches(&request));

        request.ip = Some("127.0.0.1".parse().unwrap());
        assert!(rule.matches(&request));

        request.port = 9090;
        assert!(!rule.matches(&request));
    }

    #[test]
    fn test_invalid_path_regex() {
        assert!(matches!(
            PathPattern::regex("(unclosed"),
            Err(RuleKeyError::InvalidPathRegex { .. })
        ));
    }
}
