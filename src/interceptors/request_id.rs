use async_trait::async_trait;
use http::{HeaderName, HeaderValue};

use crate::core::{
    exchange::Exchange,
    interceptor::{Flow, Interceptor, InterceptorError, InterceptorResult, Outcome},
};

/// Exchange property holding the request id.
pub const REQUEST_ID_PROPERTY: &str = "request_id";

/// Tags each request with an id, reusing one supplied by the caller.
/// The id is echoed on the response.
pub struct RequestIdInterceptor {
    header: HeaderName,
}

impl RequestIdInterceptor {
    pub fn new(header: &str) -> InterceptorResult<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|e| InterceptorError::Config(format!("header '{header}': {e}")))?;
        Ok(Self { header })
    }
}

#[async_trait]
impl Interceptor for RequestIdInterceptor {
    fn name(&self) -> &str {
        "request_id"
    }

    fn priority(&self) -> i32 {
        -100
    }

    fn flow(&self) -> Flow {
        Flow::REQUEST_RESPONSE
    }

    async fn handle_request(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        let id = match exchange.request.header(self.header.as_str()) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => exchange.id().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&id) {
            exchange.request.headers.insert(self.header.clone(), value);
        }
        exchange.set_property(REQUEST_ID_PROPERTY, id);
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        let Some(id) = exchange.property_str(REQUEST_ID_PROPERTY) else {
            return Ok(Outcome::Continue);
        };
        if let (Some(response), Ok(value)) = (exchange.response.as_mut(), HeaderValue::from_str(&id))
        {
            response.headers.insert(self.header.clone(), value);
        }
        Ok(Outcome::Continue)
    }
}
