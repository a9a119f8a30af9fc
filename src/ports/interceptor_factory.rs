use crate::{
    config::InterceptorConfig,
    core::interceptor::{InterceptorResult, SharedInterceptor},
};

/// InterceptorFactory defines the port for turning interceptor configuration
/// into chain members
pub trait InterceptorFactory: Send + Sync + 'static {
    /// Build one interceptor. Errors reject the proxy configuration.
    fn create(&self, config: &InterceptorConfig) -> InterceptorResult<SharedInterceptor>;
}
