use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    config::TargetConfig,
    core::{
        exchange::Exchange,
        expression::{ExpressionError, UrlTemplate},
        load_balancer::Balancer,
    },
};

/// Errors raised while parsing or resolving a proxy target
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TargetError {
    #[error("Invalid target URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid internal target '{0}': a proxy name is required")]
    InvalidInternal(String),

    #[error("Proxy has no target")]
    Missing,

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

pub type TargetResult<T> = Result<T, TargetError>;

/// A fixed external destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTarget {
    base: String,
    append_request_uri: bool,
}

impl StaticTarget {
    /// Parses an absolute URL. Without a base path the request's
    /// path-and-query is appended at dispatch time; with one it is used as is.
    pub fn parse(raw: &str) -> TargetResult<Self> {
        let url = url::Url::parse(raw).map_err(|e| TargetError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(TargetError::InvalidUrl {
                url: raw.to_string(),
                reason: "URL must have a host".to_string(),
            });
        }

        let no_base_path = matches!(url.path(), "" | "/") && url.query().is_none();
        Ok(Self {
            base: if no_base_path {
                raw.trim_end_matches('/').to_string()
            } else {
                raw.to_string()
            },
            append_request_uri: no_base_path,
        })
    }

    pub fn host_port(host: &str, port: u16) -> Self {
        Self {
            base: format!("http://{host}:{port}"),
            append_request_uri: true,
        }
    }

    pub fn destination(&self, request_uri: &str) -> String {
        if self.append_request_uri {
            format!("{}{}", self.base, request_uri)
        } else {
            self.base.clone()
        }
    }
}

/// `internal://<name>[/path][?query]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalTarget {
    name: String,
    /// Fixed path replacing the caller's, `None` keeps the caller's path.
    path: Option<String>,
    query: Option<String>,
}

impl InternalTarget {
    pub const SCHEME: &'static str = "internal://";

    pub fn is_internal(raw: &str) -> bool {
        raw.starts_with(Self::SCHEME)
    }

    pub fn parse(raw: &str) -> TargetResult<Self> {
        let rest = raw
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| TargetError::InvalidInternal(raw.to_string()))?;
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query.to_string())),
            None => (rest, None),
        };
        let (name, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if name.is_empty() {
            return Err(TargetError::InvalidInternal(raw.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            path: (!path.is_empty() && path != "/").then(|| path.to_string()),
            query,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path-and-query the internal proxy sees for a caller's request.
    pub fn rewrite(&self, caller_uri: &str) -> String {
        let (caller_path, caller_query) = match caller_uri.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (caller_uri, None),
        };
        let path = self.path.as_deref().unwrap_or(caller_path);
        match self.query.as_deref().or(caller_query) {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }
}

impl fmt::Display for InternalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::SCHEME, self.name)?;
        if let Some(path) = &self.path {
            write!(f, "{path}")?;
        }
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

/// Where a proxy forwards an exchange after the request pass.
#[derive(Debug, Clone)]
pub enum Target {
    None,
    Static(StaticTarget),
    Template(UrlTemplate),
    Internal(InternalTarget),
    Balancer(Arc<Balancer>),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Static(target) => write!(f, "{}", target.base),
            Self::Template(template) => write!(f, "{}", template.as_str()),
            Self::Internal(internal) => write!(f, "{internal}"),
            Self::Balancer(balancer) => write!(f, "balancer:{}", balancer.name()),
        }
    }
}

/// A target resolved against one exchange.
#[derive(Debug, Clone)]
pub enum Resolution {
    Url(String),
    Internal(InternalTarget),
    Pool(Arc<Balancer>),
}

impl Target {
    /// Parses the URL forms: absolute URL, template or internal reference.
    pub fn parse(raw: &str) -> TargetResult<Self> {
        let raw = raw.trim();
        if UrlTemplate::is_template(raw) {
            Ok(Self::Template(UrlTemplate::parse(raw)?))
        } else if InternalTarget::is_internal(raw) {
            Ok(Self::Internal(InternalTarget::parse(raw)?))
        } else if raw.contains("://") {
            Ok(Self::Static(StaticTarget::parse(raw)?))
        } else {
            Self::parse_host_port(raw)
        }
    }

    fn parse_host_port(raw: &str) -> TargetResult<Self> {
        let invalid = |reason: &str| TargetError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected an absolute URL or host:port"))?;
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Self::Static(StaticTarget::host_port(host, port)))
    }

    pub fn from_config(config: Option<&TargetConfig>) -> TargetResult<Self> {
        match config {
            None => Ok(Self::None),
            Some(TargetConfig::Url { url }) => Self::parse(url),
            Some(TargetConfig::Host { host, port }) => {
                Ok(Self::Static(StaticTarget::host_port(host, *port)))
            }
            Some(TargetConfig::Balancer(balancer)) => {
                Ok(Self::Balancer(Arc::new(Balancer::from_config(balancer))))
            }
        }
    }

    pub fn balancer(&self) -> Option<&Arc<Balancer>> {
        match self {
            Self::Balancer(balancer) => Some(balancer),
            _ => None,
        }
    }

    /// Internal proxy name this target refers to statically.
    pub fn internal_name(&self) -> Option<&str> {
        match self {
            Self::Internal(internal) => Some(internal.name()),
            _ => None,
        }
    }

    /// Resolves the target for one exchange. Templates are rendered fresh
    /// each time and may yield either an external or an internal URL.
    pub fn resolve(&self, exchange: &Exchange) -> TargetResult<Resolution> {
        match self {
            Self::None => Err(TargetError::Missing),
            Self::Static(target) => Ok(Resolution::Url(target.destination(&exchange.request.uri))),
            Self::Internal(internal) => Ok(Resolution::Internal(internal.clone())),
            Self::Balancer(balancer) => Ok(Resolution::Pool(Arc::clone(balancer))),
            Self::Template(template) => {
                let rendered = template.render(exchange)?;
                if InternalTarget::is_internal(&rendered) {
                    Ok(Resolution::Internal(InternalTarget::parse(&rendered)?))
                } else {
                    let target = StaticTarget::parse(&rendered)?;
                    Ok(Resolution::Url(target.destination(&exchange.request.uri)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exchange::Request;

    fn resolve_url(target: &str, request_uri: &str) -> String {
        let exc = Exchange::new(Request::get(request_uri));
        match Target::parse(target).unwrap().resolve(&exc).unwrap() {
            Resolution::Url(url) => url,
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_static_url_without_base_path_appends_request() {
        assert_eq!(
            resolve_url("http://backend:8080", "/api/users?page=2"),
            "http://backend:8080/api/users?page=2"
        );
        assert_eq!(
            resolve_url("https://backend/", "/x"),
            "https://backend/x"
        );
    }

    #[test]
    fn test_static_url_with_base_path_is_verbatim() {
        assert_eq!(
            resolve_url("http://backend:8080/fixed/endpoint", "/api/users"),
            "http://backend:8080/fixed/endpoint"
        );
    }

    #[test]
    fn test_host_port_target() {
        assert_eq!(resolve_url("localhost:3000", "/a?b"), "http://localhost:3000/a?b");
        assert!(Target::parse("localhost").is_err());
        assert!(Target::parse("localhost:http").is_err());
    }

    #[test]
    fn test_internal_path_rewriting() {
        let bare = InternalTarget::parse("internal://tservice").unwrap();
        assert_eq!(bare.name(), "tservice");
        assert_eq!(bare.rewrite("/foo"), "/foo");

        let slash = InternalTarget::parse("internal://tservice/").unwrap();
        assert_eq!(slash.rewrite("/foo"), "/foo");

        let fixed = InternalTarget::parse("internal://tservice/a").unwrap();
        assert_eq!(fixed.rewrite("/foo"), "/a");
    }

    #[test]
    fn test_internal_query_handling() {
        let keeps = InternalTarget::parse("internal://svc/a").unwrap();
        assert_eq!(keeps.rewrite("/foo?x=1"), "/a?x=1");

        let replaces = InternalTarget::parse("internal://svc/a?y=2").unwrap();
        assert_eq!(replaces.rewrite("/foo?x=1"), "/a?y=2");
        assert_eq!(replaces.to_string(), "internal://svc/a?y=2");

        assert!(InternalTarget::parse("internal://").is_err());
        assert!(InternalTarget::parse("internal:///a").is_err());
    }

    #[test]
    fn test_template_may_resolve_internal() {
        let target = Target::parse("internal://${property.route}").unwrap();
        let mut exc = Exchange::new(Request::get("/orders"));
        exc.set_property("route", "orders");
        match target.resolve(&exc).unwrap() {
            Resolution::Internal(internal) => assert_eq!(internal.name(), "orders"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_template_resolves_external() {
        let target = Target::parse("http://${header.X-Backend}:9000").unwrap();
        let exc = Exchange::new(Request::get("/v1/items").with_header("X-Backend", "svc-b"));
        match target.resolve(&exc).unwrap() {
            Resolution::Url(url) => assert_eq!(url, "http://svc-b:9000/v1/items"),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn test_missing_target() {
        let exc = Exchange::new(Request::get("/"));
        assert!(matches!(Target::None.resolve(&exc), Err(TargetError::Missing)));
    }
}
