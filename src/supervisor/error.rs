//! Supervisor error taxonomy. Identity/configuration errors are returned to the
//! caller; process-lifecycle errors are mostly recorded in the server's own log.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Server '{0}' already exists")]
    DuplicateId(String),

    #[error("Server '{0}' not found")]
    NotFound(String),

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailure { command: String, reason: String },

    #[error("Failed to write to server '{id}': {reason}")]
    WriteFailure { id: String, reason: String },

    /// Never returned by a public operation; logged where it happens.
    #[error("Failed to terminate pid {pid}: {reason}")]
    TerminationFailure { pid: u32, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DuplicateId(_) => StatusCode::CONFLICT,
            Self::WriteFailure { .. } => StatusCode::CONFLICT,
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::SpawnFailure { .. } | Self::TerminationFailure { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DuplicateId(_) => "DUPLICATE_ID",
            Self::NotFound(_) => "NOT_FOUND",
            Self::SpawnFailure { .. } => "SPAWN_FAILURE",
            Self::WriteFailure { .. } => "WRITE_FAILURE",
            Self::TerminationFailure { .. } => "TERMINATION_FAILURE",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
