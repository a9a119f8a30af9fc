use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::{
    config::HeaderActions,
    core::{
        exchange::Exchange,
        interceptor::{Flow, Interceptor, InterceptorError, InterceptorResult, Outcome},
    },
};

/// Parsed header edits; removals run before additions.
#[derive(Debug, Clone, Default)]
struct HeaderRules {
    add: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderRules {
    fn parse(actions: &HeaderActions) -> InterceptorResult<Self> {
        let name = |raw: &str| {
            HeaderName::from_bytes(raw.as_bytes())
                .map_err(|e| InterceptorError::Config(format!("header '{raw}': {e}")))
        };

        let mut add = Vec::with_capacity(actions.add.len());
        for (raw, value) in &actions.add {
            let value = HeaderValue::from_str(value)
                .map_err(|e| InterceptorError::Config(format!("header '{raw}' value: {e}")))?;
            add.push((name(raw)?, value));
        }
        let remove = actions
            .remove
            .iter()
            .map(|raw| name(raw))
            .collect::<InterceptorResult<Vec<_>>>()?;

        Ok(Self { add, remove })
    }

    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.add {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Adds and removes request and response headers.
pub struct HeadersInterceptor {
    request: HeaderRules,
    response: HeaderRules,
}

impl HeadersInterceptor {
    pub fn new(request: &HeaderActions, response: &HeaderActions) -> InterceptorResult<Self> {
        Ok(Self {
            request: HeaderRules::parse(request)?,
            response: HeaderRules::parse(response)?,
        })
    }
}

#[async_trait]
impl Interceptor for HeadersInterceptor {
    fn name(&self) -> &str {
        "headers"
    }

    fn flow(&self) -> Flow {
        match (self.request.is_empty(), self.response.is_empty()) {
            (false, true) => Flow::REQUEST,
            (true, false) => Flow::RESPONSE,
            _ => Flow::REQUEST_RESPONSE,
        }
    }

    async fn handle_request(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        self.request.apply(&mut exchange.request.headers);
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        if let Some(response) = exchange.response.as_mut() {
            self.response.apply(&mut response.headers);
        }
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::core::exchange::{Request, Response};

    fn actions(add: &[(&str, &str)], remove: &[&str]) -> HeaderActions {
        HeaderActions {
            add: add
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            remove: remove.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_rewrites_request_and_response() {
        let interceptor = HeadersInterceptor::new(
            &actions(&[("X-Gateway", "gantry")], &["Cookie"]),
            &actions(&[], &["Server"]),
        )
        .unwrap();
        assert_eq!(interceptor.flow(), Flow::REQUEST_RESPONSE);

        let mut exchange =
            Exchange::new(Request::get("/").with_header("Cookie", "session=1"));
        interceptor.handle_request(&mut exchange).await.unwrap();
        assert_eq!(exchange.request.header("x-gateway"), Some("gantry"));
        assert!(exchange.request.header("cookie").is_none());

        exchange.set_response(Response::ok().with_header("Server", "backend/1.0"));
        interceptor.handle_response(&mut exchange).await.unwrap();
        assert!(exchange.response.unwrap().header("server").is_none());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let result = HeadersInterceptor::new(&actions(&[("bad header", "x")], &[]), &actions(&[], &[]));
        assert!(matches!(result, Err(InterceptorError::Config(_))));
    }

    #[test]
    fn test_flow_follows_configured_sides() {
        let request_only =
            HeadersInterceptor::new(&actions(&[("X-A", "1")], &[]), &actions(&[], &[])).unwrap();
        assert_eq!(request_only.flow(), Flow::REQUEST);
    }
}
