use std::{sync::Arc, time::Duration};

use tokio::time::sleep;

use crate::{core::GatewayService, utils::ShutdownToken};

/// Retries initialization of inactive proxies on a fixed interval, so a
/// proxy whose interceptor could not start (a missing key file, an
/// unreachable dependency) comes up without a restart.
pub struct Reinitializer {
    gateway_service: Arc<GatewayService>,
    interval: Duration,
}

impl Reinitializer {
    pub fn new(gateway_service: Arc<GatewayService>, interval: Duration) -> Self {
        Self {
            gateway_service,
            interval,
        }
    }

    pub async fn run(&self, shutdown: ShutdownToken) {
        let mut shutdown = std::pin::pin!(shutdown.wait_for_shutdown());
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Reinitializer stopped");
                    return;
                }
                _ = sleep(self.interval) => {}
            }
            self.run_once().await;
        }
    }

    /// One pass; returns how many proxies became active.
    pub async fn run_once(&self) -> usize {
        let pending = self.gateway_service.registry().inactive().len();
        if pending == 0 {
            return 0;
        }
        let activated = self.gateway_service.reinitialize_inactive().await;
        if activated > 0 {
            tracing::info!("Reinitialized {} of {} inactive proxies", activated, pending);
        } else {
            tracing::debug!("{} proxies remain inactive", pending);
        }
        activated
    }
}
