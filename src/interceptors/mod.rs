//! Built-in interceptors, constructed from [`InterceptorConfig`].

pub mod access_log;
pub mod headers;
pub mod rate_limit;
pub mod request_id;
pub mod set_property;
pub mod static_response;

use std::sync::Arc;

pub use access_log::AccessLogInterceptor;
pub use headers::HeadersInterceptor;
pub use rate_limit::RateLimitInterceptor;
pub use request_id::RequestIdInterceptor;
pub use set_property::SetPropertyInterceptor;
pub use static_response::StaticResponseInterceptor;

use crate::{
    config::InterceptorConfig,
    core::interceptor::{InterceptorResult, SharedInterceptor},
    ports::interceptor_factory::InterceptorFactory,
};

/// Factory for every interceptor type the configuration file can name.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinInterceptorFactory;

impl InterceptorFactory for BuiltinInterceptorFactory {
    fn create(&self, config: &InterceptorConfig) -> InterceptorResult<SharedInterceptor> {
        let interceptor: SharedInterceptor = match config {
            InterceptorConfig::RequestId { header } => Arc::new(RequestIdInterceptor::new(header)?),
            InterceptorConfig::Headers { request, response } => {
                Arc::new(HeadersInterceptor::new(request, response)?)
            }
            InterceptorConfig::AccessLog => Arc::new(AccessLogInterceptor),
            InterceptorConfig::StaticResponse {
                status,
                body,
                content_type,
            } => Arc::new(StaticResponseInterceptor::new(*status, body, content_type)?),
            InterceptorConfig::RateLimit(rate_limit) => {
                Arc::new(RateLimitInterceptor::new(rate_limit)?)
            }
            InterceptorConfig::SetProperty { name, value } => {
                Arc::new(SetPropertyInterceptor::new(name, value.clone())?)
            }
        };
        Ok(interceptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_builds_every_type() {
        let configs: Vec<InterceptorConfig> = serde_json::from_str(
            r#"[
                {"type": "request_id"},
                {"type": "headers", "request": {"add": {"X-Env": "prod"}}},
                {"type": "access_log"},
                {"type": "static_response", "body": "ok"},
                {"type": "rate_limit", "by": "route", "requests": 1, "period": "1s"},
                {"type": "set_property", "name": "tenant", "value": "acme"}
            ]"#,
        )
        .unwrap();

        let names: Vec<String> = configs
            .iter()
            .map(|c| BuiltinInterceptorFactory.create(c).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            [
                "request_id",
                "headers",
                "access_log",
                "static_response",
                "rate_limit",
                "set_property"
            ]
        );
    }

    #[test]
    fn test_factory_rejects_bad_configuration() {
        let config = InterceptorConfig::StaticResponse {
            status: 1000,
            body: String::new(),
            content_type: "text/plain".to_string(),
        };
        assert!(BuiltinInterceptorFactory.create(&config).is_err());
    }
}
