use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable condition kind attached to every terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    InvalidArgument,
    NotFound,
    DeadlineExceeded,
    Canceled,
    Unavailable,
    Internal,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::InvalidArgument => "invalid_argument",
            Code::NotFound => "not_found",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::Canceled => "canceled",
            Code::Unavailable => "unavailable",
            Code::Internal => "internal",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error status carried as data inside a response chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Terminal failure of a `Generate`, `GenerateStream` or `DoWork` call.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("request payload is required")]
    MissingPayload,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("model {0} is not supported")]
    UnsupportedModel(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("request canceled")]
    Canceled,

    /// Status reported by the agent (or pushed by the dispatcher) inside a chunk.
    #[error("{}", .0.message)]
    Remote(Status),

    #[error("agent stream failed: {0}")]
    AgentStream(String),

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> Code {
        match self {
            DispatchError::MissingPayload | DispatchError::InvalidArgument(_) => Code::InvalidArgument,
            DispatchError::UnsupportedModel(_) => Code::NotFound,
            DispatchError::DeadlineExceeded(_) => Code::DeadlineExceeded,
            DispatchError::Canceled => Code::Canceled,
            DispatchError::Remote(status) => status.code,
            DispatchError::AgentStream(_) | DispatchError::ShuttingDown => Code::Unavailable,
            DispatchError::Internal(_) => Code::Internal,
        }
    }

    /// Label used for the `error` dimension of the request metrics.
    pub fn label(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn to_status(&self) -> Status {
        match self {
            DispatchError::Remote(status) => status.clone(),
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

impl From<Status> for DispatchError {
    fn from(status: Status) -> Self {
        DispatchError::Remote(status)
    }
}

/// Rejected dispatcher configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one supported model is required")]
    NoModels,

    #[error("model {0} is listed more than once")]
    DuplicateModel(String),

    #[error("backlog size must be at least 1")]
    ZeroBacklog,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_agent_message() {
        let err = DispatchError::from(Status::new(Code::Internal, "inference error"));
        assert_eq!(err.to_string(), "inference error");
        assert_eq!(err.code(), Code::Internal);
        assert_eq!(err.label(), "internal");
    }

    #[test]
    fn local_errors_carry_codes() {
        assert_eq!(DispatchError::MissingPayload.code(), Code::InvalidArgument);
        assert_eq!(
            DispatchError::UnsupportedModel("x".into()).to_status().code,
            Code::NotFound
        );
        assert_eq!(DispatchError::Canceled.label(), "canceled");
    }

    #[test]
    fn code_serializes_snake_case() {
        let json = serde_json::to_string(&Status::new(Code::DeadlineExceeded, "late")).unwrap();
        assert_eq!(json, r#"{"code":"deadline_exceeded","message":"late"}"#);
    }
}
