use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Failed to spawn '{program}': {reason}")]
    SpawnError { program: String, reason: String },

    #[error("Engine command failed: {0}")]
    EngineCommandError(String),

    #[error("Engine output could not be parsed: {0}")]
    ParseError(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("No active {0}")]
    NotFound(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

/// Wire form of an [`AppError`], shared by both transports.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInputArgument(_) | AppError::SerdeJsonError(_) => "invalid_params",
            AppError::CommandBlocked(_) => "blocked",
            AppError::NotFound(_) | AppError::UnknownAction(_) => "not_found",
            AppError::SpawnError { .. } | AppError::EngineCommandError(_) | AppError::ParseError(_) => "engine",
            AppError::Unsupported(_) => "unsupported",
            AppError::StdIoError(_) | AppError::ConfigError(_) => "internal",
        }
    }
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        tracing::error!("AppError converted to error body: {:?}", err);
        ErrorBody {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_group_errors_by_caller_action() {
        assert_eq!(AppError::InvalidInputArgument("x".into()).code(), "invalid_params");
        assert_eq!(AppError::CommandBlocked("rm".into()).code(), "blocked");
        assert_eq!(AppError::UnknownAction("nope".into()).code(), "not_found");
        assert_eq!(AppError::EngineCommandError("boom".into()).code(), "engine");

        let body = ErrorBody::from(&AppError::NotFound("terminal".into()));
        assert_eq!(body.code, "not_found");
        assert_eq!(body.message, "No active terminal");
    }
}
