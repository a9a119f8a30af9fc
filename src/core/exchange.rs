//! The per-request transaction threaded through rule matching, the
//! interceptor chain and target dispatch.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::Value;

use crate::core::{backend::Node, proxy::Proxy, rule_key::RequestKey};

/// Inbound request as seen by interceptors and the dispatcher.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path and query, always starting with `/`.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        let mut uri = uri.into();
        if !uri.starts_with('/') {
            uri.insert(0, '/');
        }
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Adds a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Host header value, empty when absent.
    pub fn host(&self) -> &str {
        self.header(header::HOST.as_str()).unwrap_or_default()
    }
}

/// Response produced by a backend, an internal proxy or an interceptor.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Why an exchange ended in the abort flow.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExchangeFault {
    /// An interceptor returned an error or panicked.
    Interceptor { interceptor: String, message: String },
    /// The backend could not be reached or did not answer in time.
    Backend {
        destination: String,
        message: String,
        timed_out: bool,
    },
    /// The target could not be turned into a destination.
    Resolution(String),
    /// No node of a pool was available.
    Unavailable(String),
    /// The internal target names no known internal proxy.
    UnknownInternal(String),
    /// Internal dispatch nested deeper than allowed.
    LoopDetected { proxy: String, depth: usize },
    /// An internal proxy aborted.
    InternalAbort { proxy: String },
}

impl fmt::Display for ExchangeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interceptor {
                interceptor,
                message,
            } => write!(f, "interceptor '{interceptor}' failed: {message}"),
            Self::Backend {
                destination,
                message,
                ..
            } => write!(f, "backend {destination} failed: {message}"),
            Self::Resolution(message) => write!(f, "target resolution failed: {message}"),
            Self::Unavailable(message) => write!(f, "no node available: {message}"),
            Self::UnknownInternal(name) => write!(f, "unknown internal proxy '{name}'"),
            Self::LoopDetected { proxy, depth } => write!(
                f,
                "internal dispatch to '{proxy}' exceeded the maximum depth of {depth}"
            ),
            Self::InternalAbort { proxy } => write!(f, "internal proxy '{proxy}' aborted"),
        }
    }
}

/// A single request/response transaction.
#[derive(Debug)]
pub struct Exchange {
    id: String,
    pub request: Request,
    pub response: Option<Response>,
    /// Candidate destinations, tried in order by the dispatcher.
    pub destinations: Vec<String>,
    properties: HashMap<String, Value>,
    proxy: Option<Arc<Proxy>>,
    chain_end: usize,
    fault: Option<ExchangeFault>,
    pub bind_ip: Option<IpAddr>,
    pub bind_port: u16,
    pub remote_addr: Option<SocketAddr>,
    depth: usize,
    dispatched_node: Option<Arc<Node>>,
    started_at: Instant,
}

impl Exchange {
    pub fn new(request: Request) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request,
            response: None,
            destinations: Vec::new(),
            properties: HashMap::new(),
            proxy: None,
            chain_end: 0,
            fault: None,
            bind_ip: None,
            bind_port: 0,
            remote_addr: None,
            depth: 0,
            dispatched_node: None,
            started_at: Instant::now(),
        }
    }

    /// Sets the local port (and optionally IP) the request arrived on.
    pub fn bound_to(mut self, ip: Option<IpAddr>, port: u16) -> Self {
        self.bind_ip = ip;
        self.bind_port = port;
        self
    }

    pub fn from_remote(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Matching inputs for the proxy registry.
    pub fn request_key(&self) -> RequestKey<'_> {
        RequestKey {
            ip: self.bind_ip,
            port: self.bind_port,
            method: self.request.method.as_str(),
            host: self.request.host(),
            path: self.request.path(),
        }
    }

    pub fn proxy(&self) -> Option<&Arc<Proxy>> {
        self.proxy.as_ref()
    }

    pub(crate) fn assign_proxy(&mut self, proxy: Arc<Proxy>) {
        self.proxy = Some(proxy);
        self.chain_end = 0;
    }

    /// Number of chain positions entered by the request pass.
    pub fn chain_end(&self) -> usize {
        self.chain_end
    }

    pub(crate) fn set_chain_end(&mut self, end: usize) {
        self.chain_end = end;
    }

    pub fn fault(&self) -> Option<&ExchangeFault> {
        self.fault.as_ref()
    }

    /// Records a fault, keeping the first one when several occur.
    pub fn set_fault(&mut self, fault: ExchangeFault) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    pub fn set_response(&mut self, response: Response) {
        self.response = Some(response);
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Property rendered as a plain string (strings unquoted).
    pub fn property_str(&self, key: &str) -> Option<String> {
        self.properties.get(key).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    /// Internal-dispatch nesting level, zero for transport-originated exchanges.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn dispatched_node(&self) -> Option<&Arc<Node>> {
        self.dispatched_node.as_ref()
    }

    pub(crate) fn set_dispatched_node(&mut self, node: Arc<Node>) {
        self.dispatched_node = Some(node);
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Builds the exchange handed to an internal proxy: same method, headers,
    /// body and properties, the rewritten path, one level deeper.
    pub(crate) fn derive_internal(&self, uri: String) -> Exchange {
        let mut request = self.request.clone();
        request.uri = uri;
        Exchange {
            id: self.id.clone(),
            request,
            response: None,
            destinations: Vec::new(),
            properties: self.properties.clone(),
            proxy: None,
            chain_end: 0,
            fault: None,
            bind_ip: self.bind_ip,
            bind_port: self.bind_port,
            remote_addr: self.remote_addr,
            depth: self.depth + 1,
            dispatched_node: None,
            started_at: Instant::now(),
        }
    }

    /// Takes over the result of an internal exchange: its response becomes
    /// this exchange's backend response and its properties are copied back.
    pub(crate) fn absorb_internal(&mut self, inner: Exchange) {
        self.properties = inner.properties;
        self.response = inner.response;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_path_and_query() {
        let request = Request::get("/orders/7?expand=items");
        assert_eq!(request.path(), "/orders/7");
        assert_eq!(request.query(), Some("expand=items"));

        let request = Request::get("status");
        assert_eq!(request.uri, "/status");
        assert_eq!(request.query(), None);
    }

    #[test]
    fn test_first_fault_wins() {
        let mut exc = Exchange::new(Request::get("/"));
        exc.set_fault(ExchangeFault::Resolution("first".into()));
        exc.set_fault(ExchangeFault::Resolution("second".into()));
        assert_eq!(exc.fault(), Some(&ExchangeFault::Resolution("first".into())));
    }

    #[test]
    fn test_derive_internal_carries_request_and_properties() {
        let mut exc = Exchange::new(
            Request::new(Method::POST, "/outer?a=1")
                .with_header("X-Trace", "abc")
                .with_body("payload"),
        );
        exc.set_property("tenant", "acme");

        let inner = exc.derive_internal("/inner".to_string());
        assert_eq!(inner.id(), exc.id());
        assert_eq!(inner.depth(), 1);
        assert_eq!(inner.request.method, Method::POST);
        assert_eq!(inner.request.uri, "/inner");
        assert_eq!(inner.request.header("x-trace"), Some("abc"));
        assert_eq!(inner.request.body, Bytes::from("payload"));
        assert_eq!(inner.property_str("tenant").as_deref(), Some("acme"));
    }

    #[test]
    fn test_absorb_internal_copies_back() {
        let mut exc = Exchange::new(Request::get("/"));
        let mut inner = exc.derive_internal("/".to_string());
        inner.set_property("seen", true);
        inner.set_response(Response::ok().with_body("text/plain", "hi"));

        exc.absorb_internal(inner);
        assert_eq!(exc.property("seen"), Some(&Value::Bool(true)));
        assert_eq!(exc.response.map(|r| r.body_text()).as_deref(), Some("hi"));
    }
}
