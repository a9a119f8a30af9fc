pub mod backend;
pub mod exchange;
pub mod expression;
pub mod flow;
pub mod gateway;
pub mod interceptor;
pub mod load_balancer;
pub mod problem;
pub mod proxy;
pub mod registry;
pub mod rule_key;
pub mod target;

pub use exchange::{Exchange, ExchangeFault, Request, Response};
pub use gateway::{DispatchSettings, GatewayService};
pub use interceptor::{Flow, Interceptor, InterceptorError, Outcome};
pub use load_balancer::LoadBalancerFactory;
pub use proxy::{Proxy, ProxyFactory};
pub use registry::ProxyRegistry;
