use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::Rng;
use scc::HashMap;

use super::{DispatchError, DispatchStrategy, NodeOutcome, RoundRobinStrategy};
use crate::{
    config::FaultMonitoringConfig,
    core::{
        backend::{Node, NodeStatus},
        exchange::Exchange,
    },
};

const MIN_SCORE: f64 = 0.0001;

#[derive(Debug, Clone, Copy)]
struct FaultProfile {
    score: f64,
    last_failure: Instant,
}

/// Prefers nodes without recent failures.
///
/// Each failing node carries a score that halves on every failure. While
/// enough candidates are flawless they are served round robin; otherwise a
/// node is drawn with probability proportional to its score.
pub struct FaultMonitoringStrategy {
    profiles: HashMap<String, FaultProfile>,
    round_robin: RoundRobinStrategy,
    min_flawless_ratio: f64,
    clear_after: Duration,
    max_failures: u32,
}

impl Default for FaultMonitoringStrategy {
    fn default() -> Self {
        Self::from_config(&FaultMonitoringConfig::default())
    }
}

impl FaultMonitoringStrategy {
    pub fn from_config(config: &FaultMonitoringConfig) -> Self {
        Self {
            profiles: HashMap::new(),
            round_robin: RoundRobinStrategy::new(),
            min_flawless_ratio: config.min_flawless_ratio,
            clear_after: Duration::from_secs(config.clear_after_secs),
            max_failures: config.max_failures,
        }
    }

    /// Current score of a node, `None` when it has no fault profile.
    pub async fn score(&self, node: &Node) -> Option<f64> {
        self.profiles
            .get_async(&node.address())
            .await
            .map(|entry| entry.get().score)
    }

    async fn forget_stale_profiles(&self) {
        let clear_after = self.clear_after;
        self.profiles
            .retain_async(|_, profile| profile.last_failure.elapsed() < clear_after)
            .await;
    }

    fn pick_weighted(scored: &[(Arc<Node>, f64)]) -> Option<Arc<Node>> {
        let total: f64 = scored.iter().map(|(_, score)| score).sum();
        let mut point = rand::rng().random::<f64>() * total;
        for (node, score) in scored {
            if point < *score {
                return Some(Arc::clone(node));
            }
            point -= score;
        }
        scored.last().map(|(node, _)| Arc::clone(node))
    }
}

#[async_trait]
impl DispatchStrategy for FaultMonitoringStrategy {
    fn name(&self) -> &'static str {
        "fault_monitoring"
    }

    async fn dispatch(
        &self,
        _exchange: &Exchange,
        nodes: &[Arc<Node>],
    ) -> Result<Arc<Node>, DispatchError> {
        let offered: Vec<Arc<Node>> = nodes
            .iter()
            .filter(|n| n.status() != NodeStatus::Takeout)
            .cloned()
            .collect();
        let up: Vec<Arc<Node>> = offered.iter().filter(|n| n.is_up()).cloned().collect();
        let candidates = if up.is_empty() { offered } else { up };

        match candidates.len() {
            0 => return Err(DispatchError::NoAvailableNode(self.name().to_string())),
            1 => return Ok(Arc::clone(&candidates[0])),
            _ => {}
        }

        self.forget_stale_profiles().await;

        let mut flawless = Vec::new();
        let mut scored = Vec::with_capacity(candidates.len());
        for node in &candidates {
            match self.score(node).await {
                Some(score) => scored.push((Arc::clone(node), score.max(MIN_SCORE))),
                None => {
                    flawless.push(Arc::clone(node));
                    scored.push((Arc::clone(node), 1.0));
                }
            }
        }

        let ratio = flawless.len() as f64 / candidates.len() as f64;
        let picked = if !flawless.is_empty() && ratio >= self.min_flawless_ratio {
            self.round_robin.next_of(&flawless)
        } else {
            Self::pick_weighted(&scored)
        };
        picked.ok_or_else(|| DispatchError::NoAvailableNode(self.name().to_string()))
    }

    async fn done(&self, node: &Arc<Node>, outcome: NodeOutcome) {
        let key = node.address();
        if !outcome.is_failure() {
            self.profiles.remove_async(&key).await;
            return;
        }

        let now = Instant::now();
        self.profiles
            .entry_async(key)
            .await
            .and_modify(|profile| {
                profile.score = (profile.score / 2.0).max(MIN_SCORE);
                profile.last_failure = now;
            })
            .or_insert_with(|| FaultProfile {
                score: 0.5,
                last_failure: now,
            });

        if self.max_failures > 0 && node.failure_run() >= self.max_failures && node.is_up() {
            tracing::warn!(
                "Node {} failed {} times in a row, marking DOWN",
                node.address(),
                node.failure_run()
            );
            node.set_status(NodeStatus::Down);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::exchange::Request;

    fn nodes(count: u16) -> Vec<Arc<Node>> {
        (1..=count)
            .map(|port| Arc::new(Node::new("node", port)))
            .collect()
    }

    fn exchange() -> Exchange {
        Exchange::new(Request::get("/"))
    }

    #[tokio::test]
    async fn test_flawless_nodes_round_robin() {
        let strategy = FaultMonitoringStrategy::default();
        let nodes = nodes(2);
        let a = strategy.dispatch(&exchange(), &nodes).await.unwrap();
        let b = strategy.dispatch(&exchange(), &nodes).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_failing_node_avoided_while_enough_are_flawless() {
        let strategy = FaultMonitoringStrategy::default();
        let nodes = nodes(3);
        nodes[0].record_failure();
        strategy.done(&nodes[0], NodeOutcome::Failure).await;
        assert_eq!(strategy.score(&nodes[0]).await, Some(0.5));

        for _ in 0..20 {
            let picked = strategy.dispatch(&exchange(), &nodes).await.unwrap();
            assert_ne!(picked.port(), 1);
        }
    }

    #[tokio::test]
    async fn test_score_halves_and_clears_on_success() {
        let strategy = FaultMonitoringStrategy::default();
        let node = Arc::new(Node::new("node", 1));
        strategy.done(&node, NodeOutcome::Failure).await;
        strategy.done(&node, NodeOutcome::ServerError(502)).await;
        assert_eq!(strategy.score(&node).await, Some(0.25));

        strategy.done(&node, NodeOutcome::Success(200)).await;
        assert_eq!(strategy.score(&node).await, None);
    }

    #[tokio::test]
    async fn test_weighted_pick_when_mostly_faulty() {
        let strategy = FaultMonitoringStrategy::default();
        let nodes = nodes(3);
        for node in &nodes[..2] {
            strategy.done(node, NodeOutcome::Failure).await;
        }
        // one flawless out of three is below the ratio, every node stays reachable
        for _ in 0..20 {
            assert!(strategy.dispatch(&exchange(), &nodes).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_takeout_never_offered() {
        let strategy = FaultMonitoringStrategy::default();
        let nodes = nodes(2);
        nodes[0].set_status(NodeStatus::Takeout);
        nodes[1].set_status(NodeStatus::Down);

        // no UP node: fall back to the non-TAKEOUT ones
        for _ in 0..5 {
            let picked = strategy.dispatch(&exchange(), &nodes).await.unwrap();
            assert_eq!(picked.port(), 2);
        }

        nodes[1].set_status(NodeStatus::Takeout);
        assert!(strategy.dispatch(&exchange(), &nodes).await.is_err());
    }

    #[tokio::test]
    async fn test_consecutive_failures_mark_down() {
        let strategy = FaultMonitoringStrategy::from_config(&FaultMonitoringConfig {
            max_failures: 2,
            ..Default::default()
        });
        let node = Arc::new(Node::new("node", 1));
        for _ in 0..2 {
            node.record_failure();
            strategy.done(&node, NodeOutcome::Failure).await;
        }
        assert_eq!(node.status(), NodeStatus::Down);
    }

    #[tokio::test]
    async fn test_profiles_expire() {
        let strategy = FaultMonitoringStrategy::from_config(&FaultMonitoringConfig {
            clear_after_secs: 0,
            ..Default::default()
        });
        let nodes = nodes(2);
        strategy.done(&nodes[0], NodeOutcome::Failure).await;
        strategy.dispatch(&exchange(), &nodes).await.unwrap();
        assert_eq!(strategy.score(&nodes[0]).await, None);
    }
}
