//! `application/problem+json` error responses.

use http::StatusCode;
use serde::Serialize;

use crate::core::exchange::{ExchangeFault, Response};

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

const TYPE_PREFIX: &str = "urn:gantry:problem:";

#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

impl ProblemDetails {
    pub fn new(status: StatusCode, kind: &str, title: impl Into<String>) -> Self {
        Self {
            kind: format!("{TYPE_PREFIX}{kind}"),
            title: title.into(),
            status: status.as_u16(),
            detail: None,
            instance: None,
            component: None,
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not-found", "No matching proxy")
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "Internal error").detail(detail)
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    /// Maps an exchange fault onto the status and title clients see.
    pub fn from_fault(fault: &ExchangeFault) -> Self {
        let problem = match fault {
            ExchangeFault::Interceptor { interceptor, .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "interceptor",
                "Interceptor failure",
            )
            .component(interceptor.clone()),
            ExchangeFault::Backend {
                timed_out: true, ..
            } => Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", "Backend timeout"),
            ExchangeFault::Backend { .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                "backend",
                "Backend unreachable",
            ),
            ExchangeFault::Resolution(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "target",
                "Target resolution failed",
            ),
            ExchangeFault::Unavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "No node available",
            ),
            ExchangeFault::UnknownInternal(name) => Self::new(
                StatusCode::BAD_GATEWAY,
                "internal-routing",
                "Unknown internal proxy",
            )
            .component(name.clone()),
            ExchangeFault::LoopDetected { proxy, .. } => Self::new(
                StatusCode::LOOP_DETECTED,
                "loop-detected",
                "Internal routing loop",
            )
            .component(proxy.clone()),
            ExchangeFault::InternalAbort { proxy } => Self::new(
                StatusCode::BAD_GATEWAY,
                "internal-routing",
                "Internal proxy aborted",
            )
            .component(proxy.clone()),
        };
        problem.detail(fault.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::to_vec(&self).unwrap_or_default();
        Response::new(status).with_body(PROBLEM_CONTENT_TYPE, body)
    }
}
