use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Constants for node status to replace magic numbers
const NODE_STATUS_UP: u8 = 0;
const NODE_STATUS_DOWN: u8 = 1;
const NODE_STATUS_TAKEOUT: u8 = 2;

/// Errors related to node operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NodeError {
    /// Error when a status name is not recognised
    #[error("Unknown node status: {0}")]
    UnknownStatus(String),
}

/// Availability of a pool node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Eligible for dispatch.
    Up,
    /// Failed health checks or too many consecutive failures.
    Down,
    /// Administratively drained; never dispatched to and ignored by probes.
    Takeout,
}

impl NodeStatus {
    fn as_u8(self) -> u8 {
        match self {
            NodeStatus::Up => NODE_STATUS_UP,
            NodeStatus::Down => NODE_STATUS_DOWN,
            NodeStatus::Takeout => NODE_STATUS_TAKEOUT,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            NODE_STATUS_UP => NodeStatus::Up,
            NODE_STATUS_TAKEOUT => NodeStatus::Takeout,
            _ => NodeStatus::Down,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Up => "UP",
            NodeStatus::Down => "DOWN",
            NodeStatus::Takeout => "TAKEOUT",
        };
        write!(f, "{s}")
    }
}

impl FromStr for NodeStatus {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(NodeStatus::Up),
            "DOWN" => Ok(NodeStatus::Down),
            "TAKEOUT" => Ok(NodeStatus::Takeout),
            _ => Err(NodeError::UnknownStatus(s.to_string())),
        }
    }
}

/// A member of a load-balanced pool with its live status and counters.
#[derive(Debug)]
pub struct Node {
    host: String,
    port: u16,
    health_url: Option<String>,
    status: AtomicU8,
    requests: AtomicU64,
    open_threads: AtomicU64,
    failures: AtomicU64,
    /// Consecutive failed dispatches, reset on the next success
    consecutive_dispatch_failures: AtomicU32,
    /// Counter for consecutive successful health checks
    pub consecutive_successes: AtomicU32,
    /// Counter for consecutive failed health checks
    pub consecutive_failures: AtomicU32,
}

impl Node {
    /// Creates a node that starts out UP.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            health_url: None,
            status: AtomicU8::new(NODE_STATUS_UP),
            requests: AtomicU64::new(0),
            open_threads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_dispatch_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, also used as the node's identity within a pool.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }

    /// Absolute URL for a request path-and-query on this node.
    pub fn destination(&self, uri: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, uri)
    }

    /// Explicit health URL, else `path` on the node itself.
    pub fn health_url(&self, path: &str) -> String {
        match &self.health_url {
            Some(url) => url.clone(),
            None => self.destination(path),
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: NodeStatus) -> NodeStatus {
        let previous = NodeStatus::from_u8(self.status.swap(status.as_u8(), Ordering::AcqRel));
        if previous != status {
            tracing::info!("Node {} status {} -> {}", self.address(), previous, status);
            if status == NodeStatus::Up {
                self.consecutive_dispatch_failures.store(0, Ordering::Release);
            }
        }
        previous
    }

    pub fn is_up(&self) -> bool {
        self.status() == NodeStatus::Up
    }

    /// Records a dispatch to this node.
    pub fn dispatched(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.open_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that a dispatched call finished.
    pub fn completed(&self) {
        let _ = self
            .open_threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Records a successful call, ending any failure run.
    pub fn record_success(&self) {
        self.consecutive_dispatch_failures.store(0, Ordering::Release);
    }

    /// Records a failed call and returns the length of the current failure run.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_dispatch_failures
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    /// Length of the current run of failed calls.
    pub fn failure_run(&self) -> u32 {
        self.consecutive_dispatch_failures.load(Ordering::Acquire)
    }

    /// Applies a successful probe. Returns true when this brought the node UP.
    pub fn probe_succeeded(&self, healthy_threshold: u32) -> bool {
        self.consecutive_failures.store(0, Ordering::Release);
        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if self.status() == NodeStatus::Down && successes >= healthy_threshold {
            self.set_status(NodeStatus::Up);
            return true;
        }
        false
    }

    /// Applies a failed probe. Returns true when this took the node DOWN.
    pub fn probe_failed(&self, unhealthy_threshold: u32) -> bool {
        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if self.status() == NodeStatus::Up && failures >= unhealthy_threshold {
            self.set_status(NodeStatus::Down);
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            host: self.host.clone(),
            port: self.port,
            status: self.status(),
            requests: self.requests.load(Ordering::Relaxed),
            open_threads: self.open_threads.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a node for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub requests: u64,
    pub open_threads: u64,
    pub failures: u64,
}
