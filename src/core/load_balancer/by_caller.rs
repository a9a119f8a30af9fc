use std::sync::Arc;

use async_trait::async_trait;
use scc::HashMap;

use super::{DispatchError, DispatchStrategy, RoundRobinStrategy};
use crate::core::{backend::Node, exchange::Exchange};

/// Sessions kept before the affinity table is flushed
const MAX_SESSIONS: usize = 100_000;

/// Sends each caller to the same node for as long as that node stays UP.
///
/// The caller is the first `X-Forwarded-For` entry, else the remote IP.
/// Requests without either are spread round robin.
pub struct ByCallerStrategy {
    sessions: HashMap<String, Arc<Node>>,
    fallback: RoundRobinStrategy,
}

impl Default for ByCallerStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ByCallerStrategy {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            fallback: RoundRobinStrategy::new(),
        }
    }

    fn caller_key(exchange: &Exchange) -> Option<String> {
        exchange
            .request
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| exchange.remote_addr.map(|addr| addr.ip().to_string()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl DispatchStrategy for ByCallerStrategy {
    fn name(&self) -> &'static str {
        "by_caller"
    }

    async fn dispatch(
        &self,
        exchange: &Exchange,
        nodes: &[Arc<Node>],
    ) -> Result<Arc<Node>, DispatchError> {
        let up: Vec<Arc<Node>> = nodes.iter().filter(|n| n.is_up()).cloned().collect();
        let no_node = || DispatchError::NoAvailableNode(self.name().to_string());

        let Some(caller) = Self::caller_key(exchange) else {
            return self.fallback.next_of(&up).ok_or_else(no_node);
        };

        let sticky = self
            .sessions
            .get_async(&caller)
            .await
            .map(|entry| Arc::clone(entry.get()));
        if let Some(node) = sticky {
            if up.iter().any(|n| Arc::ptr_eq(n, &node)) {
                return Ok(node);
            }
            tracing::debug!(
                "Caller {} lost node {}, reassigning",
                caller,
                node.address()
            );
        }

        let node = self.fallback.next_of(&up).ok_or_else(no_node)?;
        if self.sessions.len() >= MAX_SESSIONS {
            tracing::warn!("Affinity table reached {} callers, flushing", MAX_SESSIONS);
            self.sessions.retain_async(|_, _| false).await;
        }
        self.sessions
            .entry_async(caller)
            .await
            .and_modify(|assigned| *assigned = Arc::clone(&node))
            .or_insert_with(|| Arc::clone(&node));
        Ok(node)
    }
}
