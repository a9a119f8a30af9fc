use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{HeaderMap, Uri, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::{
    core::exchange::{Request, Response},
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// HTTP client adapter using Hyper with Rustls.
///
/// Bodies are fully buffered in both directions, so a response can be
/// replayed against another node on failover and inspected by response
/// interceptors.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    probe_client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        let connector = || {
            let mut http_connector = HttpConnector::new();
            http_connector.enforce_http(false);
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls_config.clone())
                .https_or_http()
                .enable_http1()
                .wrap_connector(http_connector)
        };

        let client = Client::builder(TokioExecutor::new()).build(connector());
        let probe_client = Client::builder(TokioExecutor::new()).build(connector());

        tracing::info!("Created HTTP client");
        Ok(Self {
            client,
            probe_client,
        })
    }

    /// Translates an exchange request into the outgoing hyper request.
    fn outgoing(request: &Request, destination: &str) -> HttpClientResult<hyper::Request<Full<Bytes>>> {
        let uri: Uri = destination
            .parse()
            .map_err(|e| HttpClientError::InvalidRequest(format!("{destination}: {e}")))?;
        let authority = uri
            .authority()
            .ok_or_else(|| {
                HttpClientError::InvalidRequest(format!("{destination}: URI has no host"))
            })?
            .clone();

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        headers.insert(header::HOST, host);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static("Gantry/0.1"));
        }

        let mut outgoing = hyper::Request::builder()
            .method(request.method.clone())
            .uri(uri)
            .version(Version::HTTP_11)
            .body(Full::new(request.body.clone()))
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        *outgoing.headers_mut() = headers;
        Ok(outgoing)
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send(&self, request: &Request, destination: &str) -> HttpClientResult<Response> {
        let outgoing = Self::outgoing(request, destination)?;
        tracing::debug!("Sending request: {} {}", outgoing.method(), outgoing.uri());

        let response = self.client.request(outgoing).await.map_err(|e| {
            tracing::error!(
                "Error making request to backend {} ({}): {}",
                destination,
                request.method,
                e
            );
            HttpClientError::ConnectionError(format!(
                "Request to {} {destination} failed: {e}",
                request.method
            ))
        })?;

        let (mut parts, body) = response.into_parts();
        tracing::Span::current().record("http.status_code", parts.status.as_u16());
        let body = body
            .collect()
            .await
            .map_err(|e| {
                HttpClientError::ConnectionError(format!("Reading body from {destination}: {e}"))
            })?
            .to_bytes();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool> {
        let request = hyper::Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(Empty::<Bytes>::new())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!("Health checking URL: {}", url);
        match timeout(
            Duration::from_secs(timeout_secs),
            self.probe_client.request(request),
        )
        .await
        {
            Ok(Ok(response)) => {
                let is_healthy = response.status().is_success();
                // Consume the body to prevent resource leaks
                let _ = response.into_body().collect().await;
                tracing::debug!("Health check for {} result: {}", url, is_healthy);
                Ok(is_healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health check error for {}: {}", url, err);
                Ok(false)
            }
            Err(_) => {
                tracing::debug!("Health check timeout for {}", url);
                Err(HttpClientError::Timeout(timeout_secs))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[test]
    fn test_outgoing_sets_host_and_strips_hop_by_hop() {
        let request = Request::get("/orders?id=1")
            .with_header("Host", "gateway.example.com")
            .with_header("Connection", "keep-alive")
            .with_header("X-Trace", "t-1")
            .with_body("payload");

        let outgoing =
            HttpClientAdapter::outgoing(&request, "http://backend:8080/orders?id=1").unwrap();
        assert_eq!(outgoing.uri().path(), "/orders");
        assert_eq!(outgoing.headers()[header::HOST], "backend:8080");
        assert_eq!(outgoing.headers()["x-trace"], "t-1");
        assert!(!outgoing.headers().contains_key(header::CONNECTION));
        assert_eq!(outgoing.headers()[header::USER_AGENT], "Gantry/0.1");
    }

    #[test]
    fn test_outgoing_rejects_relative_destination() {
        let request = Request::get("/");
        assert!(matches!(
            HttpClientAdapter::outgoing(&request, "/no-host"),
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_invalid_url() {
        let client = HttpClientAdapter::new().unwrap();
        assert!(matches!(
            client.health_check("invalid url", 1).await,
            Err(HttpClientError::InvalidRequest(_))
        ));
    }
}
