use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::time::sleep;

use crate::{
    config::HealthCheckConfig,
    core::{
        GatewayService,
        backend::{Node, NodeStatus},
        load_balancer::Balancer,
    },
    ports::http_client::HttpClient,
    utils::ShutdownToken,
};

/// Result of one sweep over every pool node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub healthy: usize,
    pub went_down: usize,
    pub came_up: usize,
}

/// Periodically probes every balancer node and moves it between UP and
/// DOWN once the configured thresholds are crossed. TAKEOUT nodes are left
/// alone.
pub struct HealthChecker {
    gateway_service: Arc<GatewayService>,
    http_client: Arc<dyn HttpClient>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        gateway_service: Arc<GatewayService>,
        http_client: Arc<dyn HttpClient>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            gateway_service,
            http_client,
            config,
        }
    }

    /// Run the health checker loop until shutdown
    pub async fn run(&self, shutdown: ShutdownToken) {
        if !self.config.enabled {
            tracing::info!("Health checking is disabled");
            return;
        }

        let interval = Duration::from_secs(self.config.interval_secs);
        tracing::info!(
            "Starting health checker with interval: {}s, timeout: {}s, default path: {}",
            self.config.interval_secs,
            self.config.timeout_secs,
            self.config.path
        );

        let mut shutdown = std::pin::pin!(shutdown.wait_for_shutdown());
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Health checker stopped");
                    return;
                }
                _ = sleep(interval) => {}
            }

            let summary = self.check_all().await;
            tracing::debug!("Health check cycle completed: {:?}", summary);
        }
    }

    /// Probes every node of every balancer once. Probes run concurrently;
    /// their results are applied in pool order.
    pub async fn check_all(&self) -> SweepSummary {
        let targets: Vec<(Arc<Balancer>, Arc<Node>)> = self
            .gateway_service
            .registry()
            .balancers()
            .into_iter()
            .flat_map(|balancer| {
                balancer
                    .nodes()
                    .iter()
                    .filter(|node| node.status() != NodeStatus::Takeout)
                    .map(|node| (balancer.clone(), node.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        let results = join_all(targets.iter().map(|(_, node)| self.probe(node))).await;

        let mut summary = SweepSummary {
            probed: targets.len(),
            ..SweepSummary::default()
        };
        for ((balancer, node), healthy) in targets.iter().zip(results) {
            if healthy {
                summary.healthy += 1;
                if node.probe_succeeded(self.config.healthy_threshold) {
                    tracing::info!(
                        "Node {} in balancer {} is now UP",
                        node.address(),
                        balancer.name()
                    );
                    summary.came_up += 1;
                }
            } else if node.probe_failed(self.config.unhealthy_threshold) {
                tracing::warn!(
                    "Node {} in balancer {} is now DOWN",
                    node.address(),
                    balancer.name()
                );
                summary.went_down += 1;
            }
        }
        summary
    }

    async fn probe(&self, node: &Node) -> bool {
        let url = node.health_url(&self.config.path);
        match self
            .http_client
            .health_check(&url, self.config.timeout_secs)
            .await
        {
            Ok(healthy) => {
                if !healthy {
                    tracing::info!("Health check failed for {}: backend reported unhealthy", url);
                }
                healthy
            }
            Err(err) => {
                tracing::info!("Health check failed for {}: {}", url, err);
                false
            }
        }
    }
}
