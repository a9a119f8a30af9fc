use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;

use super::{DispatchError, DispatchStrategy};
use crate::core::{backend::Node, exchange::Exchange};

/// Rotates over the nodes that are currently UP.
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    /// Next node among `candidates`, `None` when there are none.
    pub fn next_of(&self, candidates: &[Arc<Node>]) -> Option<Arc<Node>> {
        if candidates.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&candidates[count % candidates.len()]))
    }
}

#[async_trait]
impl DispatchStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    async fn dispatch(
        &self,
        _exchange: &Exchange,
        nodes: &[Arc<Node>],
    ) -> Result<Arc<Node>, DispatchError> {
        let up: Vec<Arc<Node>> = nodes.iter().filter(|n| n.is_up()).cloned().collect();
        self.next_of(&up)
            .ok_or_else(|| DispatchError::NoAvailableNode(self.name().to_string()))
    }
}
