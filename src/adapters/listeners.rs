//! Listening sockets for external proxies.
//!
//! Sockets are bound once for the configured rules at startup and on demand
//! when the admin API registers a proxy on an endpoint nothing accepts yet.
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use thiserror::Error;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};

use crate::{
    adapters::http_handler::{ConnectionAddrs, HttpHandler},
    core::GatewayService,
    utils::{GracefulShutdown, ShutdownReason},
};

type Endpoint = (Option<IpAddr>, u16);

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ListenerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Port {0} already has listeners on specific addresses")]
    WildcardConflict(u16),
}

/// Sockets to bind for the given rule endpoints. A wildcard rule on a port
/// takes the whole port; connections still report their local address, so
/// address-bound rules on that port keep matching.
pub fn listener_plan(endpoints: &BTreeSet<Endpoint>) -> Vec<Endpoint> {
    let mut by_port: BTreeMap<u16, Vec<Option<IpAddr>>> = BTreeMap::new();
    for (ip, port) in endpoints {
        by_port.entry(*port).or_default().push(*ip);
    }

    let mut plan = Vec::new();
    for (port, ips) in by_port {
        if ips.contains(&None) {
            plan.push((None, port));
        } else {
            plan.extend(ips.into_iter().map(|ip| (ip, port)));
        }
    }
    plan
}

/// The gateway's bound sockets and the server tasks behind them.
pub struct ListenerSet {
    gateway_service: Arc<GatewayService>,
    shutdown: Arc<GracefulShutdown>,
    bound: Mutex<BTreeSet<Endpoint>>,
    servers: Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerSet {
    pub fn new(gateway_service: Arc<GatewayService>, shutdown: Arc<GracefulShutdown>) -> Self {
        Self {
            gateway_service,
            shutdown,
            bound: Mutex::new(BTreeSet::new()),
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Binds every endpoint the registry's external proxies need.
    pub async fn listen_all(&self) -> Result<(), ListenerError> {
        let endpoints = self.gateway_service.registry().listen_endpoints();
        for (ip, port) in listener_plan(&endpoints) {
            self.ensure_listening(ip, port).await?;
        }
        Ok(())
    }

    /// Makes sure connections to `(ip, port)` are accepted. Returns false when
    /// an existing socket already covers the endpoint.
    pub async fn ensure_listening(
        &self,
        ip: Option<IpAddr>,
        port: u16,
    ) -> Result<bool, ListenerError> {
        let mut bound = self.bound.lock().await;
        if bound.contains(&(None, port)) || bound.contains(&(ip, port)) {
            return Ok(false);
        }
        if ip.is_none() && bound.iter().any(|(_, p)| *p == port) {
            return Err(ListenerError::WildcardConflict(port));
        }

        let addr = SocketAddr::new(ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        bound.insert((ip, port));
        drop(bound);

        tracing::info!("Gantry listening on {}", addr);
        let handle = self.spawn_server(listener, addr, ip, port);
        self.servers.lock().await.push(handle);
        Ok(true)
    }

    fn spawn_server(
        &self,
        listener: TcpListener,
        addr: SocketAddr,
        ip: Option<IpAddr>,
        port: u16,
    ) -> JoinHandle<()> {
        let handler = Arc::new(HttpHandler::new(self.gateway_service.clone(), ip, port));
        let router = handler.router();
        let token = self.shutdown.shutdown_token();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let served = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<ConnectionAddrs>(),
            )
            .with_graceful_shutdown(async move {
                let reason = token.wait_for_shutdown().await;
                tracing::info!("Listener {} stopping: {:?}", addr, reason);
            })
            .await;

            if let Err(e) = served {
                tracing::error!("Server error on {}: {}", addr, e);
                shutdown.trigger_shutdown(ShutdownReason::Force);
            }
        })
    }

    pub async fn endpoints(&self) -> BTreeSet<Endpoint> {
        self.bound.lock().await.clone()
    }

    /// Waits for every server task, including ones started while waiting.
    pub async fn wait(&self) {
        loop {
            let next = self.servers.lock().await.pop();
            let Some(handle) = next else { break };
            if let Err(e) = handle.await {
                tracing::error!("Listener task failed: {}", e);
            }
        }
    }
}
