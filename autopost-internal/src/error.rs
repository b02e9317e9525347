use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use std::fmt::{Debug, Display};
use tokio::sync::OnceCell;

/// Controls whether to include internal details (store errors, config paths) in error bodies
///
/// WARNING: Setting this to true may expose quota store addresses in responses.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

fn debug_enabled() -> bool {
    *DEBUG.get().unwrap_or(&false)
}

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if debug_enabled() {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    FileRead {
        message: String,
        file_path: String,
    },
    InternalError {
        message: String,
    },
    InvalidSubscriberKey,
    MissingSubscriberKey,
    Observability {
        message: String,
    },
    QuotaExceeded {
        allotment: u64,
        used: u64,
    },
    QuotaStore {
        backend: &'static str,
        message: String,
    },
    QuotaStoreTimeout {
        backend: &'static str,
        timeout_ms: u64,
    },
    QuotaStoreUnavailable {
        reason: String,
    },
    QuotaStoreUnconfigured,
    RouteNotFound {
        path: String,
        method: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::FileRead { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidSubscriberKey => tracing::Level::WARN,
            ErrorDetails::MissingSubscriberKey => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::QuotaStore { .. } => tracing::Level::WARN,
            ErrorDetails::QuotaStoreTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::QuotaStoreUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::QuotaStoreUnconfigured => tracing::Level::ERROR,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::FileRead { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidSubscriberKey => StatusCode::UNAUTHORIZED,
            ErrorDetails::MissingSubscriberKey => StatusCode::UNAUTHORIZED,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::QuotaStore { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::QuotaStoreTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::QuotaStoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::QuotaStoreUnconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
        }
    }

    /// Machine-readable error type included in response bodies
    fn error_type(&self) -> &'static str {
        match self {
            ErrorDetails::InvalidSubscriberKey => "invalid_subscriber_key",
            ErrorDetails::MissingSubscriberKey => "missing_subscriber_key",
            ErrorDetails::QuotaExceeded { .. } => "quota_exceeded",
            ErrorDetails::QuotaStoreUnavailable { .. } => "quota_store_unavailable",
            ErrorDetails::RouteNotFound { .. } => "not_found",
            ErrorDetails::QuotaStore { .. } | ErrorDetails::QuotaStoreTimeout { .. } => {
                "quota_store_error"
            }
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::FileRead { .. }
            | ErrorDetails::InternalError { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::QuotaStoreUnconfigured => "internal_error",
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::FileRead { message, file_path } => {
                write!(f, "Error reading file {file_path}: {message}")
            }
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidSubscriberKey => write!(f, "Invalid subscriber key"),
            ErrorDetails::MissingSubscriberKey => write!(f, "Missing X-Auth-Key header"),
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::QuotaExceeded { allotment, used } => write!(
                f,
                "Daily quota exceeded: {used} of {allotment} requests used today"
            ),
            ErrorDetails::QuotaStore { backend, message } => {
                write!(f, "Quota store `{backend}` error: {message}")
            }
            ErrorDetails::QuotaStoreTimeout {
                backend,
                timeout_ms,
            } => write!(f, "Quota store `{backend}` timed out after {timeout_ms}ms"),
            ErrorDetails::QuotaStoreUnavailable { reason } => {
                write!(f, "Unable to verify quota: {reason}")
            }
            ErrorDetails::QuotaStoreUnconfigured => {
                write!(f, "Quota store operation attempted with no store configured")
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
        }
    }
}

impl Error {
    /// Build the JSON body returned to clients
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let status = self.status_code();
        let message = match self.get_details() {
            // Store internals stay out of client responses unless debug is on
            ErrorDetails::QuotaStore { .. } | ErrorDetails::QuotaStoreTimeout { .. }
                if !debug_enabled() =>
            {
                "Quota store error".to_string()
            }
            ErrorDetails::QuotaStoreUnavailable { .. } if !debug_enabled() => {
                "Unable to verify quota".to_string()
            }
            _ => DisplayOrDebugGateway::new(self).to_string(),
        };
        let mut error = json!({
            "message": message,
            "type": self.get_details().error_type(),
            "code": status.as_u16(),
        });
        if let ErrorDetails::QuotaExceeded { allotment, used } = self.get_details() {
            error["allotment"] = json!(allotment);
            error["used"] = json!(used);
        }
        (status, json!({ "error": error }))
    }
}

impl IntoResponse for Error {
    /// Convert the (already logged) error into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}
