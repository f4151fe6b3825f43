// Error types shared across the proxy and the activation controller
//
// The request path never unwinds past the handler: every internal failure
// maps to a structured response here. Activation errors are cloneable so a
// coalesced scale-up can hand the starter's outcome to every waiter.

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use serde_json::json;
use thiserror::Error;

/// Failures on the activation path (pod lifecycle)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActivationError {
    /// Readiness wait exceeded the startup deadline
    #[error("backend did not become ready within {0} seconds")]
    StartupTimeout(u64),

    /// Pod create/delete/get or configmap access failed
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
}

/// Failures on the request path
#[derive(Debug, Error)]
pub enum ProxyError {
    /// JSON parse failure on entry
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Requested model id is not in the registry
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Registry read failed
    #[error("registry error: {0}")]
    Registry(String),

    /// Backend unavailable after the startup deadline
    #[error(transparent)]
    Activation(#[from] ActivationError),

    /// Backend refused or dropped the connection mid-proxy
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Response assembly failed
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Activation(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "invalid_request_error",
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::Registry(_) => "registry_unavailable",
            ProxyError::Activation(ActivationError::StartupTimeout(_)) => "backend_starting",
            ProxyError::Activation(ActivationError::Orchestrator(_)) => "orchestrator_error",
            ProxyError::Upstream(_) => "upstream_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": error_type_for(status),
                "code": self.code(),
            }
        });

        tracing::error!("request failed: {} - {}", status, self);

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");

        // Backend-not-ready responses invite a retry once startup completes
        if status == StatusCode::SERVICE_UNAVAILABLE {
            builder = builder.header(header::RETRY_AFTER, "10");
        }

        builder
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// OpenAI error envelope `type` field for a status class
pub fn error_type_for(status: StatusCode) -> &'static str {
    if status == StatusCode::NOT_FOUND {
        "not_found_error"
    } else if status.is_client_error() {
        "invalid_request_error"
    } else {
        "api_error"
    }
}

/// Anthropic-shaped error envelope: `{type: "error", error: {...}}`
pub fn anthropic_error_body(status: StatusCode, message: &str, code: &str) -> serde_json::Value {
    json!({
        "type": "error",
        "error": {
            "message": message,
            "type": error_type_for(status),
            "code": code,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::ModelNotFound("m".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::Activation(ActivationError::StartupTimeout(120)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyError::Upstream("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_anthropic_envelope_shape() {
        let body = anthropic_error_body(StatusCode::NOT_FOUND, "no such model", "model_not_found");
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["code"], "model_not_found");
        assert_eq!(body["error"]["type"], "not_found_error");
    }

    #[test]
    fn test_activation_error_is_cloneable() {
        let e = ActivationError::StartupTimeout(120);
        let e2 = e.clone();
        assert_eq!(e, e2);
    }
}
