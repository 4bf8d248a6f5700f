// src/error.rs
// Error taxonomy shared by the ingress layer, the engine and sync.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum P2pError {
    /// Structural parse failure or invalid field values.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Chain id mismatch, missing/invalid signature, unbound peer.
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// Conflicting proposal, equivocation, regressing QC.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Lane full or engine not answering in time.
    #[error("busy: {0}")]
    Busy(String),

    /// Valid but behind the local tip; nothing applied.
    #[error("stale: {0}")]
    Stale(String),
}

impl P2pError {
    pub fn kind(&self) -> &'static str {
        match self {
            P2pError::Malformed(_) => "malformed",
            P2pError::AuthFailed(_) => "auth_failed",
            P2pError::Conflict(_) => "conflict",
            P2pError::NotFound(_) => "not_found",
            P2pError::Busy(_) => "busy",
            P2pError::Stale(_) => "stale",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            P2pError::Malformed(_) | P2pError::Conflict(_) => StatusCode::BAD_REQUEST,
            P2pError::AuthFailed(_) => StatusCode::FORBIDDEN,
            P2pError::NotFound(_) => StatusCode::NOT_FOUND,
            P2pError::Busy(_) | P2pError::Stale(_) => StatusCode::OK,
        }
    }

    fn detail(&self) -> &str {
        match self {
            P2pError::Malformed(m)
            | P2pError::AuthFailed(m)
            | P2pError::Conflict(m)
            | P2pError::NotFound(m)
            | P2pError::Busy(m)
            | P2pError::Stale(m) => m,
        }
    }
}

impl IntoResponse for P2pError {
    fn into_response(self) -> Response {
        let body = match &self {
            P2pError::Busy(reason) => json!({
                "ok": true,
                "accepted": false,
                "busy": true,
                "reason": reason,
            }),
            P2pError::Stale(reason) => json!({
                "ok": true,
                "accepted": false,
                "applied": false,
                "stale": true,
                "reason": reason,
            }),
            other => {
                log::debug!("p2p reject ({}): {}", other.kind(), other.detail());
                json!({
                    "ok": false,
                    "error": other.kind(),
                    "detail": other.detail(),
                })
            }
        };
        (self.status(), Json(body)).into_response()
    }
}
