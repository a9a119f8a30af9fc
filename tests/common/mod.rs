// Shared helpers for the integration tests
#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use gantry::{
    GatewayService,
    config::ServerConfig,
    core::{Exchange, Request, Response},
    interceptors::BuiltinInterceptorFactory,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};
use http::Method;

/// Answers every call with the destination URL as body, except for hosts
/// listed in `dead`, which refuse the connection, and hosts in `stalled`,
/// which never answer.
#[derive(Default)]
pub struct MockBackend {
    dead: Mutex<HashSet<String>>,
    stalled: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kill(&self, host: &str) {
        self.dead.lock().unwrap().insert(host.to_string());
    }

    pub fn stall(&self, host: &str) {
        self.stalled.lock().unwrap().insert(host.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn is_dead(&self, destination: &str) -> bool {
        targets_any(&self.dead, destination)
    }

    fn is_stalled(&self, destination: &str) -> bool {
        targets_any(&self.stalled, destination)
    }
}

#[async_trait]
impl HttpClient for MockBackend {
    async fn send(&self, _request: &Request, destination: &str) -> HttpClientResult<Response> {
        self.calls.lock().unwrap().push(destination.to_string());
        if self.is_dead(destination) {
            return Err(HttpClientError::ConnectionError(format!(
                "connection refused: {destination}"
            )));
        }
        if self.is_stalled(destination) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(Response::ok().with_body("text/plain", destination.to_string()))
    }

    async fn health_check(&self, url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
        Ok(!self.is_dead(url))
    }
}

fn targets_any(hosts: &Mutex<HashSet<String>>, destination: &str) -> bool {
    hosts
        .lock()
        .unwrap()
        .iter()
        .any(|host| destination.contains(&format!("//{host}")))
}

pub async fn gateway(config: &ServerConfig, backend: Arc<MockBackend>) -> GatewayService {
    GatewayService::from_config(config, backend, Arc::new(BuiltinInterceptorFactory))
        .await
        .unwrap()
}

/// A GET exchange arriving on `port` for `host`.
pub fn exchange(port: u16, host: &str, uri: &str) -> Exchange {
    Exchange::new(Request::get(uri).with_header("Host", host)).bound_to(None, port)
}

/// A POST exchange arriving on `port` for `host`.
pub fn post_exchange(port: u16, host: &str, uri: &str) -> Exchange {
    Exchange::new(Request::new(Method::POST, uri).with_header("Host", host)).bound_to(None, port)
}
