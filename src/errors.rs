use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

use crate::policy::codec::CodecError;

#[derive(Debug, Error, Diagnostic)]
pub enum GateError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(rolegate::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(rolegate::serde))]
    Serde(#[from] serde_json::Error),

    #[error("JOSE error: {0}")]
    #[diagnostic(code(rolegate::jose))]
    Jose(String),

    #[error("Misconfiguration: {0}")]
    #[diagnostic(
        code(rolegate::misconfigured),
        help("Fix the setting and restart; the gate never falls back to allowing everything")
    )]
    Misconfigured(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Codec(#[from] CodecError),

    #[error("Background task failed: {0}")]
    #[diagnostic(code(rolegate::task))]
    Task(#[from] tokio::task::JoinError),

    #[error("Audit sink setup failed: {0}")]
    #[diagnostic(code(rolegate::audit))]
    Audit(#[from] crate::audit::AuditError),
}

impl From<josekit::JoseError> for GateError {
    fn from(value: josekit::JoseError) -> Self {
        GateError::Jose(value.to_string())
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = match &self {
            GateError::Serde(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
