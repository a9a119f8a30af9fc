use async_trait::async_trait;

use crate::core::{
    exchange::Exchange,
    interceptor::{Interceptor, InterceptorResult, Outcome},
};

/// Logs one line per exchange once its response or abort pass reaches the
/// outermost position of the chain.
pub struct AccessLogInterceptor;

impl AccessLogInterceptor {
    fn proxy_name(exchange: &Exchange) -> &str {
        exchange.proxy().map(|p| p.name()).unwrap_or("-")
    }
}

#[async_trait]
impl Interceptor for AccessLogInterceptor {
    fn name(&self) -> &str {
        "access_log"
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    async fn handle_response(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        let status = exchange.response.as_ref().map_or(0, |r| r.status.as_u16());
        tracing::info!(
            target: "gantry::access",
            proxy = Self::proxy_name(exchange),
            method = %exchange.request.method,
            uri = %exchange.request.uri,
            status,
            node = ?exchange.dispatched_node().map(|n| n.address()),
            duration_ms = exchange.elapsed().as_millis() as u64,
            "request completed"
        );
        Ok(Outcome::Continue)
    }

    async fn handle_abort(&self, exchange: &mut Exchange) -> InterceptorResult<()> {
        tracing::warn!(
            target: "gantry::access",
            proxy = Self::proxy_name(exchange),
            method = %exchange.request.method,
            uri = %exchange.request.uri,
            fault = ?exchange.fault().map(|f| f.to_string()),
            duration_ms = exchange.elapsed().as_millis() as u64,
            "request aborted"
        );
        Ok(())
    }
}
