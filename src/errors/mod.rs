//! # Error Handling
//!
//! Crate-wide error type for the plugin host and the plugin-side server.
//! Every failure path of session acquisition, routing, dispatch and teardown
//! is an explicit variant; nothing here panics on expected failures.

use std::time::Duration;

use crate::plugin::handshake::MULTIPLEX_METADATA_KEY;

/// Custom result type for plugin operations
pub type Result<T> = std::result::Result<T, Error>;

/// Marker carried in the status message of a missing-tag rejection so the
/// host can map it back to [`Error::MissingSessionTag`].
const MISSING_TAG_MARKER: &str = "missing session tag";

/// Main error type for plugin hosting
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Magic cookie mismatch or malformed handshake response
    #[error("Handshake error: {message}")]
    Handshake { message: String },

    /// Subprocess could not be created or its transport could not be established
    #[error("Spawn error: {message}")]
    Spawn {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A unique session identifier could not be produced
    #[error("Session ID generation failed: {message}")]
    IdGeneration { message: String },

    /// The shared transport is gone; the owning subprocess died
    #[error("Routing error: {message}")]
    Routing { message: String },

    /// Multiplexed dispatch received a call without a session tag
    #[error("missing session tag: call metadata has no '{key}' entry")]
    MissingSessionTag { key: &'static str },

    /// The dispensed capability is not one this host understands
    #[error("Unsupported client type: {message}")]
    UnsupportedClientType { message: String },

    /// Request rejected before reaching the backend
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Any other failure reported by the plugin
    #[error("Backend error ({code:?}): {message}")]
    Backend { code: tonic::Code, message: String },

    /// Both the backend close and the process teardown failed
    #[error("Close failed: {backend}; teardown also failed: {teardown}")]
    Close {
        #[source]
        backend: Box<Error>,
        teardown: Box<Error>,
    },

    /// Plugin-side server failures (bind, accept, serve loop)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a spawn attempt was abandoned before completion.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnCancellation {
    #[error("spawn deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("spawn cancelled by caller")]
    Cancelled,
}

impl Error {
    /// Create a new handshake error
    pub fn handshake<S: Into<String>>(message: S) -> Self {
        Self::Handshake { message: message.into() }
    }

    /// Create a new spawn error
    pub fn spawn<S: Into<String>>(message: S) -> Self {
        Self::Spawn { message: message.into(), source: None }
    }

    /// Create a spawn error with source
    pub fn spawn_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Spawn { message: message.into(), source: Some(source.into()) }
    }

    /// Create a spawn error caused by a deadline or caller cancellation
    pub fn spawn_cancelled(cause: SpawnCancellation) -> Self {
        Self::Spawn { message: cause.to_string(), source: Some(Box::new(cause)) }
    }

    /// Create a new ID generation error
    pub fn id_generation<S: Into<String>>(message: S) -> Self {
        Self::IdGeneration { message: message.into() }
    }

    /// Create a new routing error
    pub fn routing<S: Into<String>>(message: S) -> Self {
        Self::Routing { message: message.into() }
    }

    /// Create a missing session tag error
    pub fn missing_session_tag() -> Self {
        Self::MissingSessionTag { key: MULTIPLEX_METADATA_KEY }
    }

    /// Create a new unsupported client type error
    pub fn unsupported_client_type<S: Into<String>>(message: S) -> Self {
        Self::UnsupportedClientType { message: message.into() }
    }

    /// Create a new invalid request error
    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Combine the outcome of a backend close with the outcome of teardown.
    ///
    /// A lone failure is returned unchanged; when both fail the backend error
    /// leads the chain and the teardown error rides along.
    pub fn combine_close(backend: Result<()>, teardown: Result<()>) -> Result<()> {
        match (backend, teardown) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(backend), Err(teardown)) => {
                Err(Self::Close { backend: Box::new(backend), teardown: Box::new(teardown) })
            }
        }
    }

    /// The cancellation cause, if this is a spawn abandoned by deadline or caller
    pub fn cancellation(&self) -> Option<&SpawnCancellation> {
        match self {
            Self::Spawn { source: Some(source), .. } => source.downcast_ref::<SpawnCancellation>(),
            _ => None,
        }
    }

    /// Check if the caller may retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::IdGeneration { .. })
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable => Self::routing(status.message()),
            tonic::Code::InvalidArgument if status.message().starts_with(MISSING_TAG_MARKER) => {
                Self::missing_session_tag()
            }
            tonic::Code::InvalidArgument => Self::invalid_request(status.message()),
            code => Self::Backend { code, message: status.message().to_string() },
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match &error {
            Error::MissingSessionTag { .. } => tonic::Status::invalid_argument(error.to_string()),
            Error::InvalidRequest { message } => tonic::Status::invalid_argument(message.clone()),
            Error::Routing { .. } => tonic::Status::unavailable(error.to_string()),
            Error::Backend { code, message } => tonic::Status::new(*code, message.clone()),
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages = Vec::new();
        collect_validation_messages("", &errors, &mut messages);
        Self::config(format!("Validation failed: {}", messages.join("; ")))
    }
}

/// Flatten nested validation errors into `path.field: message` entries.
fn collect_validation_messages(
    prefix: &str,
    errors: &validator::ValidationErrors,
    out: &mut Vec<String>,
) {
    use validator::ValidationErrorsKind;

    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in fields {
        let path =
            if prefix.is_empty() { field.to_string() } else { format!("{}.{}", prefix, field) };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                out.push(format!("{}: {}", path, error_messages.join(", ")));
            }
            ValidationErrorsKind::Struct(nested) => collect_validation_messages(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_validation_messages(&format!("{}[{}]", path, index), nested, out);
                }
            }
        }
    }
}
