//! JSON administration endpoints for proxies and balancer nodes.
//!
//! Served on its own listener; every route works on the live registry, so
//! changes take effect for the next request without a restart.
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRef, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::{
    adapters::listeners::ListenerSet,
    config::{NodeConfig, ProxyConfig},
    core::{
        GatewayService,
        backend::NodeStatus,
        gateway::AdminError,
        load_balancer::BalancerSnapshot,
        problem::{PROBLEM_CONTENT_TYPE, ProblemDetails},
        proxy::ProxySnapshot,
        registry::RegistryError,
    },
};

impl AdminError {
    fn status_code(&self) -> StatusCode {
        match self {
            AdminError::UnknownProxy(_)
            | AdminError::UnknownBalancer(_)
            | AdminError::UnknownNode { .. } => StatusCode::NOT_FOUND,
            AdminError::NodeExists { .. }
            | AdminError::Registry(RegistryError::DuplicateName(_))
            | AdminError::Registry(RegistryError::DuplicateBalancer(_))
            | AdminError::Listener { .. } => StatusCode::CONFLICT,
            AdminError::InvalidProxy(_) | AdminError::Build(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self.status_code() {
            StatusCode::NOT_FOUND => "admin-not-found",
            StatusCode::CONFLICT => "admin-conflict",
            StatusCode::BAD_REQUEST => "admin-invalid",
            _ => "admin",
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let problem = ProblemDetails::new(status, self.kind(), "Admin request rejected")
            .detail(self.to_string());
        let body = serde_json::to_string(&problem).unwrap_or_default();
        (status, [(header::CONTENT_TYPE, PROBLEM_CONTENT_TYPE)], body).into_response()
    }
}

type AdminResult<T> = Result<T, AdminError>;

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusUpdate {
    pub status: NodeStatus,
}

/// Admin API over a running gateway
#[derive(Clone)]
pub struct AdminApi {
    gateway_service: Arc<GatewayService>,
    listeners: Option<Arc<ListenerSet>>,
}

impl FromRef<AdminApi> for Arc<GatewayService> {
    fn from_ref(api: &AdminApi) -> Self {
        api.gateway_service.clone()
    }
}

impl AdminApi {
    /// Without listeners, proxies added at runtime only match on endpoints
    /// the embedding application already serves.
    pub fn new(gateway_service: Arc<GatewayService>) -> Self {
        Self {
            gateway_service,
            listeners: None,
        }
    }

    /// Binds a socket for every external proxy added on a new endpoint.
    pub fn with_listeners(mut self, listeners: Arc<ListenerSet>) -> Self {
        self.listeners = Some(listeners);
        self
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/admin/health", get(health))
            .route("/admin/proxies", get(list_proxies).post(add_proxy))
            .route("/admin/proxies/reinitialize", post(reinitialize))
            .route("/admin/proxies/{name}", delete(remove_proxy))
            .route("/admin/balancers", get(list_balancers))
            .route("/admin/balancers/{name}", get(get_balancer))
            .route("/admin/balancers/{name}/nodes", post(add_node))
            .route(
                "/admin/balancers/{name}/nodes/{host}/{port}",
                delete(remove_node),
            )
            .route(
                "/admin/balancers/{name}/nodes/{host}/{port}/status",
                put(set_node_status),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

type Gateway = State<Arc<GatewayService>>;

async fn health(State(gateway): Gateway) -> Json<Value> {
    let registry = gateway.registry();
    Json(json!({
        "status": "ok",
        "proxies": registry.len(),
        "inactive": registry.inactive().len(),
        "balancers": registry.balancers().len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn list_proxies(State(gateway): Gateway) -> Json<Vec<ProxySnapshot>> {
    Json(gateway.proxy_snapshots())
}

async fn add_proxy(
    State(api): State<AdminApi>,
    Json(config): Json<ProxyConfig>,
) -> AdminResult<(StatusCode, Json<ProxySnapshot>)> {
    let gateway = &api.gateway_service;
    let snapshot = gateway.add_proxy(&config).await?;

    if let (Some(listeners), false) = (&api.listeners, config.internal) {
        let endpoint = gateway
            .registry()
            .get_by_name(&snapshot.name)
            .map(|proxy| (proxy.key().ip, proxy.key().port));
        if let Some((ip, port)) = endpoint {
            if let Err(e) = listeners.ensure_listening(ip, port).await {
                tracing::warn!("Rolling back proxy {}: {}", snapshot.name, e);
                gateway.remove_proxy(&snapshot.name)?;
                return Err(AdminError::Listener {
                    proxy: snapshot.name,
                    message: e.to_string(),
                });
            }
        }
    }

    tracing::info!("Admin added proxy {}", snapshot.name);
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn remove_proxy(State(gateway): Gateway, Path(name): Path<String>) -> AdminResult<StatusCode> {
    gateway.remove_proxy(&name)?;
    tracing::info!("Admin removed proxy {}", name);
    Ok(StatusCode::NO_CONTENT)
}

async fn reinitialize(State(gateway): Gateway) -> Json<Value> {
    let activated = gateway.reinitialize_inactive().await;
    Json(json!({ "activated": activated }))
}

async fn list_balancers(State(gateway): Gateway) -> Json<Vec<BalancerSnapshot>> {
    Json(gateway.balancer_snapshots())
}

async fn get_balancer(
    State(gateway): Gateway,
    Path(name): Path<String>,
) -> AdminResult<Json<BalancerSnapshot>> {
    gateway
        .registry()
        .balancer(&name)
        .map(|b| Json(b.snapshot()))
        .ok_or(AdminError::UnknownBalancer(name))
}

async fn add_node(
    State(gateway): Gateway,
    Path(name): Path<String>,
    Json(node): Json<NodeConfig>,
) -> AdminResult<StatusCode> {
    gateway.add_node(&name, &node)?;
    Ok(StatusCode::CREATED)
}

async fn remove_node(
    State(gateway): Gateway,
    Path((name, host, port)): Path<(String, String, u16)>,
) -> AdminResult<StatusCode> {
    gateway.remove_node(&name, &host, port)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_node_status(
    State(gateway): Gateway,
    Path((name, host, port)): Path<(String, String, u16)>,
    Json(update): Json<StatusUpdate>,
) -> AdminResult<StatusCode> {
    gateway.set_node_status(&name, &host, port, update.status)?;
    tracing::info!(
        "Admin set node {}:{} in balancer {} to {}",
        host,
        port,
        name,
        update.status
    );
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::{BalancerConfig, ServerConfig, TargetConfig},
        core::exchange::{Request, Response as GatewayResponse},
        interceptors::BuiltinInterceptorFactory,
        ports::http_client::{HttpClient, HttpClientResult},
        utils::{GracefulShutdown, ShutdownReason},
    };

    struct NoClient;

    #[async_trait]
    impl HttpClient for NoClient {
        async fn send(
            &self,
            _request: &Request,
            _destination: &str,
        ) -> HttpClientResult<GatewayResponse> {
            Ok(GatewayResponse::ok())
        }

        async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    async fn gateway() -> Arc<GatewayService> {
        let config = ServerConfig::builder()
            .proxy(
                ProxyConfig::external("lb", 8080).with_target(TargetConfig::Balancer(
                    BalancerConfig {
                        name: "pool".to_string(),
                        strategy: Default::default(),
                        nodes: vec![NodeConfig::new("alpha", 81)],
                        failover: true,
                        fault_monitoring: Default::default(),
                    },
                )),
            )
            .build()
            .unwrap();
        Arc::new(
            GatewayService::from_config(
                &config,
                Arc::new(NoClient),
                Arc::new(BuiltinInterceptorFactory),
            )
            .await
            .unwrap(),
        )
    }

    fn admin(gateway: &Arc<GatewayService>) -> State<AdminApi> {
        State(AdminApi::new(gateway.clone()))
    }

    #[tokio::test]
    async fn test_proxy_lifecycle() {
        let gateway = gateway().await;

        let config = ProxyConfig::external("docs", 8081).with_url("http://docs:80");
        let (status, Json(snapshot)) = add_proxy(admin(&gateway), Json(config.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(snapshot.name, "docs");
        assert_eq!(list_proxies(State(gateway.clone())).await.0.len(), 2);

        let err = add_proxy(admin(&gateway), Json(config)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);

        let status = remove_proxy(State(gateway.clone()), Path("docs".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = remove_proxy(State(gateway), Path("docs".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_proxy_is_bad_request() {
        let gateway = gateway().await;
        let config = ProxyConfig::external("broken", 0).with_url("ftp://files");

        let response = add_proxy(admin(&gateway), Json(config))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROBLEM_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn test_node_management() {
        let gateway = gateway().await;
        let path = |port: u16| Path(("pool".to_string(), "alpha".to_string(), port));

        set_node_status(
            State(gateway.clone()),
            path(81),
            Json(StatusUpdate {
                status: NodeStatus::Takeout,
            }),
        )
        .await
        .unwrap();
        let Json(pool) = get_balancer(State(gateway.clone()), Path("pool".to_string()))
            .await
            .unwrap();
        assert_eq!(pool.nodes[0].status, NodeStatus::Takeout);

        add_node(
            State(gateway.clone()),
            Path("pool".to_string()),
            Json(NodeConfig::new("beta", 82)),
        )
        .await
        .unwrap();
        assert_eq!(list_balancers(State(gateway.clone())).await.0[0].nodes.len(), 2);

        remove_node(State(gateway.clone()), path(81)).await.unwrap();
        let err = remove_node(State(gateway.clone()), path(81)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = get_balancer(State(gateway), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_update_body() {
        let update: StatusUpdate = serde_json::from_str(r#"{"status": "DOWN"}"#).unwrap();
        assert_eq!(update.status, NodeStatus::Down);
    }

    #[tokio::test]
    async fn test_added_proxy_on_new_port_gets_a_listener() {
        let gateway = gateway().await;
        let shutdown = Arc::new(GracefulShutdown::new());
        let listeners = Arc::new(ListenerSet::new(gateway.clone(), shutdown.clone()));
        let api = AdminApi::new(gateway.clone()).with_listeners(listeners.clone());

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = ProxyConfig::external("docs", port)
            .with_ip("127.0.0.1")
            .with_url("http://docs:80");
        let (status, _) = add_proxy(State(api), Json(config)).await.unwrap();

        assert_eq!(status, StatusCode::CREATED);
        assert!(
            listeners
                .endpoints()
                .await
                .contains(&(Some("127.0.0.1".parse().unwrap()), port))
        );
        tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();

        shutdown.trigger_shutdown(ShutdownReason::Requested);
        listeners.wait().await;
    }

    #[tokio::test]
    async fn test_proxy_on_unbindable_port_is_rolled_back() {
        let gateway = gateway().await;
        let listeners = Arc::new(ListenerSet::new(
            gateway.clone(),
            Arc::new(GracefulShutdown::new()),
        ));
        let api = AdminApi::new(gateway.clone()).with_listeners(listeners);

        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ProxyConfig::external("docs", port)
            .with_ip("127.0.0.1")
            .with_url("http://docs:80");
        let response = add_proxy(State(api), Json(config))
            .await
            .unwrap_err()
            .into_response();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(gateway.registry().get_by_name("docs").is_none());
        assert_eq!(list_proxies(State(gateway)).await.0.len(), 1);
    }
}
