//! Load-balanced node pools and the strategies that pick a node per exchange.

mod by_caller;
mod fault_monitoring;
mod round_robin;

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use self::{
    by_caller::ByCallerStrategy, fault_monitoring::FaultMonitoringStrategy,
    round_robin::RoundRobinStrategy,
};
use crate::{
    config::{BalancerConfig, LoadBalanceStrategy},
    core::{
        backend::{Node, NodeSnapshot, NodeStatus},
        exchange::Exchange,
    },
};

/// Errors raised while picking a node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DispatchError {
    /// Every node of the pool is DOWN or taken out
    #[error("No available node in balancer '{0}'")]
    NoAvailableNode(String),
}

/// How a dispatched call ended, as fed back to the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Success(u16),
    ServerError(u16),
    /// Connection failure or timeout.
    Failure,
}

impl NodeOutcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, NodeOutcome::Success(_))
    }
}

/// Trait defining node selection for a pool
#[async_trait]
pub trait DispatchStrategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Picks the primary node for an exchange.
    async fn dispatch(
        &self,
        exchange: &Exchange,
        nodes: &[Arc<Node>],
    ) -> Result<Arc<Node>, DispatchError>;

    /// Feedback once a call to `node` finished.
    async fn done(&self, _node: &Arc<Node>, _outcome: NodeOutcome) {}

    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn DispatchStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// A named pool of nodes plus its dispatch strategy.
pub struct Balancer {
    name: String,
    nodes: ArcSwap<Vec<Arc<Node>>>,
    strategy: Box<dyn DispatchStrategy>,
    failover: bool,
}

impl fmt::Debug for Balancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Balancer")
            .field("name", &self.name)
            .field("strategy", &self.strategy.name())
            .field("nodes", &self.nodes.load().len())
            .field("failover", &self.failover)
            .finish()
    }
}

impl Balancer {
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<Arc<Node>>,
        strategy: Box<dyn DispatchStrategy>,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: ArcSwap::from_pointee(nodes),
            strategy,
            failover: true,
        }
    }

    pub fn from_config(config: &BalancerConfig) -> Self {
        let nodes = config
            .nodes
            .iter()
            .map(|n| {
                let node = Node::new(&n.host, n.port);
                Arc::new(match &n.health_url {
                    Some(url) => node.with_health_url(url),
                    None => node,
                })
            })
            .collect();
        let strategy = LoadBalancerFactory::create_strategy(config);
        Self::new(&config.name, nodes, strategy).with_failover(config.failover)
    }

    pub fn with_failover(mut self, failover: bool) -> Self {
        self.failover = failover;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }

    pub fn find_node(&self, host: &str, port: u16) -> Option<Arc<Node>> {
        self.nodes.load().iter().find(|n| n.is(host, port)).cloned()
    }

    /// Picks the primary node.
    pub async fn dispatch(&self, exchange: &Exchange) -> Result<Arc<Node>, DispatchError> {
        let nodes = self.nodes.load_full();
        let node = self.strategy.dispatch(exchange, &nodes).await?;
        tracing::debug!(
            "Balancer {} dispatched exchange {} to {}",
            self.name,
            exchange.id(),
            node.address()
        );
        Ok(node)
    }

    /// Primary node followed by the other UP nodes when failover is on.
    pub fn failover_order(&self, primary: &Arc<Node>) -> Vec<Arc<Node>> {
        let mut order = vec![Arc::clone(primary)];
        if self.failover {
            order.extend(
                self.nodes
                    .load()
                    .iter()
                    .filter(|n| !Arc::ptr_eq(n, primary) && n.is_up())
                    .cloned(),
            );
        }
        order
    }

    pub async fn done(&self, node: &Arc<Node>, outcome: NodeOutcome) {
        if outcome.is_failure() {
            node.record_failure();
        } else {
            node.record_success();
        }
        self.strategy.done(node, outcome).await;
    }

    /// Forces a node's status. Returns false when no such node exists.
    pub fn set_node_status(&self, host: &str, port: u16, status: NodeStatus) -> bool {
        match self.find_node(host, port) {
            Some(node) => {
                node.set_status(status);
                true
            }
            None => false,
        }
    }

    /// Adds a node. Returns false when the address is already in the pool.
    pub fn add_node(&self, node: Node) -> bool {
        let node = Arc::new(node);
        let mut added = false;
        self.nodes.rcu(|current| {
            added = !current.iter().any(|n| n.is(node.host(), node.port()));
            let mut next = current.as_ref().clone();
            if added {
                next.push(Arc::clone(&node));
            }
            next
        });
        if added {
            tracing::info!("Added node {} to balancer {}", node.address(), self.name);
        }
        added
    }

    /// Removes a node. Returns false when it was not in the pool.
    pub fn remove_node(&self, host: &str, port: u16) -> bool {
        let mut removed = false;
        self.nodes.rcu(|current| {
            let next: Vec<Arc<Node>> = current
                .iter()
                .filter(|n| !n.is(host, port))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        if removed {
            tracing::info!("Removed node {}:{} from balancer {}", host, port, self.name);
        }
        removed
    }

    pub fn snapshot(&self) -> BalancerSnapshot {
        BalancerSnapshot {
            name: self.name.clone(),
            strategy: self.strategy.name(),
            failover: self.failover,
            nodes: self.nodes.load().iter().map(|n| n.snapshot()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalancerSnapshot {
    pub name: String,
    pub strategy: &'static str,
    pub failover: bool,
    pub nodes: Vec<NodeSnapshot>,
}

/// Factory for creating dispatch strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(config: &BalancerConfig) -> Box<dyn DispatchStrategy> {
        match config.strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::ByCaller => ByCallerStrategy::new().boxed(),
            LoadBalanceStrategy::FaultMonitoring => {
                FaultMonitoringStrategy::from_config(&config.fault_monitoring).boxed()
            }
        }
    }
}
