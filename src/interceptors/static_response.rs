use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

use crate::core::{
    exchange::{Exchange, Response},
    interceptor::{Flow, Interceptor, InterceptorError, InterceptorResult, Outcome},
};

/// Answers every request itself; the target is never called.
pub struct StaticResponseInterceptor {
    status: StatusCode,
    body: Bytes,
    content_type: String,
}

impl StaticResponseInterceptor {
    pub fn new(status: u16, body: &str, content_type: &str) -> InterceptorResult<Self> {
        let status = StatusCode::from_u16(status)
            .map_err(|_| InterceptorError::Config(format!("invalid status code {status}")))?;
        Ok(Self {
            status,
            body: Bytes::copy_from_slice(body.as_bytes()),
            content_type: content_type.to_string(),
        })
    }
}

#[async_trait]
impl Interceptor for StaticResponseInterceptor {
    fn name(&self) -> &str {
        "static_response"
    }

    fn flow(&self) -> Flow {
        Flow::REQUEST
    }

    async fn handle_request(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        exchange.set_response(
            Response::new(self.status).with_body(&self.content_type, self.body.clone()),
        );
        Ok(Outcome::Return)
    }
}
