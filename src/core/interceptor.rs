use std::{fmt, ops::BitOr, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::exchange::Exchange;

/// Result of a request or response handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed to the next interceptor (or to the target).
    Continue,
    /// Stop the request pass and start the response pass from here.
    Return,
    /// Stop and run the abort pass.
    Abort,
}

/// The set of passes an interceptor participates in.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Flow(u8);

impl Flow {
    pub const REQUEST: Flow = Flow(0b001);
    pub const RESPONSE: Flow = Flow(0b010);
    pub const ABORT: Flow = Flow(0b100);
    pub const REQUEST_RESPONSE: Flow = Flow(0b011);
    pub const ALL: Flow = Flow(0b111);

    pub const fn contains(self, other: Flow) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flow {
    type Output = Flow;

    fn bitor(self, rhs: Flow) -> Flow {
        Flow(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Flow::REQUEST, "REQUEST"),
            (Flow::RESPONSE, "RESPONSE"),
            (Flow::ABORT, "ABORT"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        write!(f, "Flow({})", names.join("|"))
    }
}

/// Errors raised by interceptor handlers
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InterceptorError {
    /// A handler failed while processing the exchange
    #[error("{0}")]
    Failed(String),

    /// One-time initialization failed; the owning proxy stays inactive
    #[error("initialization failed: {0}")]
    Init(String),

    /// Configuration for a built-in interceptor was rejected
    #[error("invalid interceptor configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl InterceptorError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

pub type InterceptorResult<T> = Result<T, InterceptorError>;

/// A unit of the processing pipeline attached to a proxy.
///
/// Handlers a flow does not include are never called. An `Err` from a request
/// or response handler is treated exactly like [`Outcome::Abort`]; errors from
/// `handle_abort` are logged and otherwise ignored.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Chain position weight; lower runs first, ties keep configuration order.
    fn priority(&self) -> i32 {
        0
    }

    fn flow(&self) -> Flow {
        Flow::ALL
    }

    /// Called once before the owning proxy becomes active.
    async fn init(&self) -> InterceptorResult<()> {
        Ok(())
    }

    async fn handle_request(&self, _exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        Ok(Outcome::Continue)
    }

    async fn handle_response(&self, _exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        Ok(Outcome::Continue)
    }

    async fn handle_abort(&self, _exchange: &mut Exchange) -> InterceptorResult<()> {
        Ok(())
    }
}

pub type SharedInterceptor = Arc<dyn Interceptor>;

/// Orders a chain by priority. The sort is stable so equal priorities keep
/// their configured order.
pub fn order_chain(mut chain: Vec<SharedInterceptor>) -> Vec<SharedInterceptor> {
    chain.sort_by_key(|interceptor| interceptor.priority());
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, i32);

    #[async_trait]
    impl Interceptor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn priority(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn test_flow_contains() {
        assert!(Flow::ALL.contains(Flow::REQUEST));
        assert!(Flow::REQUEST_RESPONSE.contains(Flow::RESPONSE));
        assert!(!Flow::REQUEST_RESPONSE.contains(Flow::ABORT));
        assert_eq!(Flow::REQUEST | Flow::ABORT, Flow(0b101));
        assert_eq!(format!("{:?}", Flow::REQUEST | Flow::ABORT), "Flow(REQUEST|ABORT)");
    }

    #[test]
    fn test_order_chain_is_stable() {
        let chain: Vec<SharedInterceptor> = vec![
            Arc::new(Named("a", 10)),
            Arc::new(Named("b", 0)),
            Arc::new(Named("c", 10)),
            Arc::new(Named("d", -5)),
        ];
        let names: Vec<String> = order_chain(chain)
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        assert_eq!(names, ["d", "b", "a", "c"]);
    }
}
