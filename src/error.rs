//! Gateway outcome taxonomy.
//!
//! Every request that does not end in a forwarded upstream response ends in one
//! of these errors. Each maps to a fixed HTTP status (rate-limit rejections
//! carry their configured status) and is rendered by [`IntoResponse`].
use std::time::Duration;

use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use http::{HeaderValue, StatusCode, header};
use thiserror::Error;

/// Result of running a request through the gateway.
pub type Outcome = Result<Response<Body>, GatewayError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("No route matches {method} {path}")]
    RoutingFailure { method: String, path: String },

    #[error("Rate limit exceeded for key '{key}'")]
    AdmissionRejected {
        key: String,
        status: StatusCode,
        message: String,
    },

    #[error("Authentication required")]
    Unauthorized,

    #[error("No healthy instance available for service '{0}'")]
    NoHealthyInstance(String),

    #[error("Failed to reach upstream {target}: {reason}")]
    UpstreamConnect { target: String, reason: String },

    #[error("Upstream {target} did not answer within {timeout:?}")]
    UpstreamTimeout { target: String, timeout: Duration },

    #[error("Circuit breaker '{0}' is open")]
    BreakerOpen(String),

    #[error("Forward to '{0}' exceeds the maximum forward depth")]
    ForwardLoop(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RoutingFailure { .. } => StatusCode::NOT_FOUND,
            GatewayError::AdmissionRejected { status, .. } => *status,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamConnect { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ForwardLoop(_) => StatusCode::LOOP_DETECTED,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Failures a circuit breaker counts and a retry may absorb.
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::NoHealthyInstance(_)
                | GatewayError::UpstreamConnect { .. }
                | GatewayError::UpstreamTimeout { .. }
        )
    }

    /// Stable label used for outcome counters.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RoutingFailure { .. } => "routing_failure",
            GatewayError::AdmissionRejected { .. } => "admission_rejected",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::NoHealthyInstance(_) => "no_healthy_instance",
            GatewayError::UpstreamConnect { .. } => "upstream_connect",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::BreakerOpen(_) => "breaker_open",
            GatewayError::ForwardLoop(_) => "forward_loop",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::PayloadTooLarge(_) => "payload_too_large",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let GatewayError::AdmissionRejected { message, .. } = &self {
            return (status, message.clone()).into_response();
        }

        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });
        let mut response = (
            status,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            body.to_string(),
        )
            .into_response();

        if matches!(self, GatewayError::Unauthorized) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"rampart\""),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::RoutingFailure {
                method: "GET".into(),
                path: "/nope".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::NoHealthyInstance("customers".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::UpstreamConnect {
                target: "http://x".into(),
                reason: "refused".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::UpstreamTimeout {
                target: "http://x".into(),
                timeout: Duration::from_secs(1)
            }
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_upstream_failures() {
        assert!(GatewayError::NoHealthyInstance("a".into()).is_upstream_failure());
        assert!(!GatewayError::Unauthorized.is_upstream_failure());
        assert!(!GatewayError::BreakerOpen("a".into()).is_upstream_failure());
    }

    #[test]
    fn test_unauthorized_response_challenges() {
        let response = GatewayError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"rampart\""
        );
    }

    #[test]
    fn test_admission_rejected_uses_configured_status() {
        let response = GatewayError::AdmissionRejected {
            key: "jlong".into(),
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Too Many Requests".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
