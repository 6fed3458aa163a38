//! Error taxonomy for the control layer and its JSON error responses

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors returned by the lifecycle controller and the config store
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Malformed request shape
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Port outside the allowed range (or not a valid TCP port at all)
    #[error("invalid port {port}: port must be between {start} and {end}")]
    InvalidPort { port: i64, start: u16, end: u16 },

    /// Unknown config filename or unknown port
    #[error("{0}")]
    NotFound(String),

    /// Something is already accepting connections on the port
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// A running instance still references the config file
    #[error("configuration file {filename} is in use (running on port {port})")]
    ConfigInUse { filename: String, port: u16 },

    /// The mock-server executable could not be launched
    #[error("mock server executable '{program}' is not available: {source}")]
    ExternalToolUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem or log file failure
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The alias store could not be reached
    #[error("dependency degraded: {0}")]
    DependencyDegraded(String),
}

impl ControlError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ControlError::Io {
            context: context.into(),
            source,
        }
    }

    /// Machine-readable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            ControlError::InvalidInput(_) => ErrorCode::InvalidInput,
            ControlError::InvalidPort { .. } => ErrorCode::InvalidPort,
            ControlError::NotFound(_) => ErrorCode::NotFound,
            ControlError::PortInUse(_) => ErrorCode::PortInUse,
            ControlError::ConfigInUse { .. } => ErrorCode::ConfigInUse,
            ControlError::ExternalToolUnavailable { .. } => ErrorCode::ExternalToolUnavailable,
            ControlError::Io { .. } => ErrorCode::IoFailure,
            ControlError::DependencyDegraded(_) => ErrorCode::DependencyDegraded,
        }
    }

    /// Both port and config-file conflicts
    pub fn is_conflict(&self) -> bool {
        self.code().status_code() == StatusCode::CONFLICT
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::NotFound(_))
    }
}

/// Error codes exposed to API clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    InvalidPort,
    NotFound,
    PortInUse,
    ConfigInUse,
    ExternalToolUnavailable,
    IoFailure,
    DependencyDegraded,
    Unauthorized,
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput | ErrorCode::InvalidPort => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::PortInUse | ErrorCode::ConfigInUse => StatusCode::CONFLICT,
            ErrorCode::ExternalToolUnavailable | ErrorCode::DependencyDegraded => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::IoFailure | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Mockgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::InvalidPort => "INVALID_PORT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::PortInUse => "PORT_IN_USE",
            ErrorCode::ConfigInUse => "CONFIG_IN_USE",
            ErrorCode::ExternalToolUnavailable => "EXTERNAL_TOOL_UNAVAILABLE",
            ErrorCode::IoFailure => "IO_FAILURE",
            ErrorCode::DependencyDegraded => "DEPENDENCY_DEGRADED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// The error code
    pub code: ErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}"}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_header_value()
            )
        })
    }
}

/// Create a JSON error response with X-Mockgate-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("content-type", "application/json")
        .header("X-Mockgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<&ControlError> for Response<Full<Bytes>> {
    fn from(err: &ControlError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
