use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request, connect_info::Connected},
    http::{HeaderValue, StatusCode, header},
    routing::any,
    serve::IncomingStream,
};
use eyre::{Result, WrapErr};
use hyper::Response;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::core::{
    GatewayService,
    exchange::{self, Exchange},
    problem::ProblemDetails,
};

/// Largest request body buffered into an exchange.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Both ends of an accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionAddrs {
    pub remote: SocketAddr,
    /// `None` when the socket could not report it
    pub local: Option<SocketAddr>,
}

impl Connected<IncomingStream<'_, TcpListener>> for ConnectionAddrs {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self {
            remote: *stream.remote_addr(),
            local: stream.io().local_addr().ok(),
        }
    }
}

/// Bridges one listening socket to the gateway: converts axum requests into
/// exchanges and the resulting exchange back into a response.
pub struct HttpHandler {
    gateway_service: Arc<GatewayService>,
    bind_ip: Option<IpAddr>,
    bind_port: u16,
}

impl HttpHandler {
    pub fn new(gateway_service: Arc<GatewayService>, bind_ip: Option<IpAddr>, bind_port: u16) -> Self {
        Self {
            gateway_service,
            bind_ip,
            bind_port,
        }
    }

    /// Main request handler. `connection` carries the peer and the local
    /// address the request arrived on.
    pub async fn handle_request(
        &self,
        req: Request,
        connection: Option<ConnectionAddrs>,
    ) -> Result<Response<AxumBody>> {
        let exchange = match self.to_exchange(req, connection).await {
            Ok(exchange) => exchange,
            Err(problem) => return Self::from_gateway_response(problem.into_response()),
        };

        let exchange = self.gateway_service.handle(exchange).await;
        let response = exchange.response.unwrap_or_else(|| {
            ProblemDetails::internal("no response was produced").into_response()
        });
        Self::from_gateway_response(response)
    }

    async fn to_exchange(
        &self,
        req: Request,
        connection: Option<ConnectionAddrs>,
    ) -> Result<Exchange, ProblemDetails> {
        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| {
                ProblemDetails::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "body",
                    "Request body rejected",
                )
                .detail(e.to_string())
            })?;

        let uri = parts
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
        let mut request = exchange::Request::new(parts.method, uri).with_body(body);
        request.headers = parts.headers;

        // HTTP/2 carries the host in the URI authority only
        if !request.headers.contains_key(header::HOST) {
            if let Some(value) = parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                request.headers.insert(header::HOST, value);
            }
        }

        let mut exchange =
            Exchange::new(request).bound_to(self.local_ip(connection), self.bind_port);
        if let Some(addr) = connection.map(|c| c.remote) {
            Self::append_forwarded_for(&mut exchange.request, addr.ip());
            exchange = exchange.from_remote(addr);
        }
        Ok(exchange)
    }

    /// Address the connection was accepted on. A wildcard listener reports
    /// the concrete interface, so address-bound rules on its port still match.
    fn local_ip(&self, connection: Option<ConnectionAddrs>) -> Option<IpAddr> {
        connection
            .and_then(|c| c.local)
            .map(|addr| addr.ip().to_canonical())
            .or(self.bind_ip)
    }

    fn append_forwarded_for(request: &mut exchange::Request, ip: IpAddr) {
        let value = match request.header(X_FORWARDED_FOR) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            request.headers.insert(X_FORWARDED_FOR, value);
        }
    }

    fn from_gateway_response(response: exchange::Response) -> Result<Response<AxumBody>> {
        let mut builder = Response::builder().status(response.status);
        if let Some(headers) = builder.headers_mut() {
            *headers = response.headers;
            // the body is re-framed by the server
            headers.remove(header::CONTENT_LENGTH);
        }
        builder
            .body(AxumBody::from(response.body))
            .wrap_err("Failed to build response")
    }

    /// Router sending every path and method to this handler.
    pub fn router(self: Arc<Self>) -> Router {
        let make_request_route = |handler: Arc<HttpHandler>| {
            any(
                move |ConnectInfo(connection): ConnectInfo<ConnectionAddrs>, req: Request| {
                    let handler = handler.clone();
                    async move {
                        match handler.handle_request(req, Some(connection)).await {
                            Ok(response) => Ok::<Response<AxumBody>, Infallible>(response),
                            Err(e) => {
                                tracing::error!("Request handling error: {:?}", e);
                                let mut response =
                                    Response::new(AxumBody::from("Internal Server Error"));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                Ok(response)
                            }
                        }
                    }
                },
            )
        };

        Router::new()
            .route("/{*path}", make_request_route(self.clone()))
            .route("/", make_request_route(self))
            .layer(TraceLayer::new_for_http())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        config::{ProxyConfig, ServerConfig},
        interceptors::BuiltinInterceptorFactory,
        ports::http_client::{HttpClient, HttpClientResult},
    };

    /// Records each request and answers with the destination as body.
    #[derive(Default)]
    struct EchoClient {
        seen: Mutex<Vec<exchange::Request>>,
    }

    #[async_trait]
    impl HttpClient for EchoClient {
        async fn send(
            &self,
            request: &exchange::Request,
            destination: &str,
        ) -> HttpClientResult<exchange::Response> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(exchange::Response::ok().with_body("text/plain", destination.to_string()))
        }

        async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    async fn handler(client: Arc<EchoClient>) -> HttpHandler {
        let config = ServerConfig::builder()
            .proxy(ProxyConfig::external("api", 8080).with_url("http://backend:9000"))
            .build()
            .unwrap();
        let gateway =
            GatewayService::from_config(&config, client, Arc::new(BuiltinInterceptorFactory))
                .await
                .unwrap();
        HttpHandler::new(Arc::new(gateway), None, 8080)
    }

    fn peer(remote: &str, local: Option<&str>) -> ConnectionAddrs {
        ConnectionAddrs {
            remote: remote.parse().unwrap(),
            local: local.map(|l| l.parse().unwrap()),
        }
    }

    async fn body_text(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_request_and_returns_backend_response() {
        let client = Arc::new(EchoClient::default());
        let handler = handler(client.clone()).await;

        let req = http::Request::builder()
            .method("POST")
            .uri("/orders?page=2")
            .header("Host", "gw.local")
            .body(AxumBody::from("{}"))
            .unwrap();
        let response = handler
            .handle_request(req, Some(peer("10.1.2.3:5555", None)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "http://backend:9000/orders?page=2");

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].body.as_ref(), b"{}");
        assert_eq!(seen[0].header("x-forwarded-for"), Some("10.1.2.3"));
    }

    #[tokio::test]
    async fn test_appends_to_existing_forwarded_for() {
        let client = Arc::new(EchoClient::default());
        let handler = handler(client.clone()).await;

        let req = http::Request::builder()
            .uri("/")
            .header("X-Forwarded-For", "192.0.2.1")
            .body(AxumBody::empty())
            .unwrap();
        handler
            .handle_request(req, Some(peer("10.1.2.3:5555", None)))
            .await
            .unwrap();

        assert_eq!(
            client.seen.lock().unwrap()[0].header("x-forwarded-for"),
            Some("192.0.2.1, 10.1.2.3")
        );
    }

    #[tokio::test]
    async fn test_unmatched_port_yields_problem_json() {
        let client = Arc::new(EchoClient::default());
        let mut handler = handler(client).await;
        handler.bind_port = 9999;

        let req = http::Request::builder().uri("/").body(AxumBody::empty()).unwrap();
        let response = handler.handle_request(req, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn test_wildcard_listener_still_matches_address_bound_rules() {
        let config = ServerConfig::builder()
            .proxy(
                ProxyConfig::external("loopback", 8080)
                    .with_ip("127.0.0.1")
                    .with_url("http://local-backend:9000"),
            )
            .proxy(ProxyConfig::external("api", 8080).with_url("http://backend:9000"))
            .build()
            .unwrap();
        let gateway = GatewayService::from_config(
            &config,
            Arc::new(EchoClient::default()),
            Arc::new(BuiltinInterceptorFactory),
        )
        .await
        .unwrap();
        let handler = HttpHandler::new(Arc::new(gateway), None, 8080);

        let cases = [
            (Some("127.0.0.1:8080"), "http://local-backend:9000/"),
            (Some("10.0.0.9:8080"), "http://backend:9000/"),
            (None, "http://backend:9000/"),
        ];
        for (local, expected) in cases {
            let req = http::Request::builder().uri("/").body(AxumBody::empty()).unwrap();
            let response = handler
                .handle_request(req, Some(peer("10.1.2.3:5555", local)))
                .await
                .unwrap();
            assert_eq!(body_text(response).await, expected, "local {local:?}");
        }
    }
}
