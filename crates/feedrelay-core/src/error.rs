//! Error taxonomy shared by every feedrelay crate

use thiserror::Error;

/// Closed set of failure kinds the relay distinguishes.
///
/// Callers never infer severity from the variant nesting; they ask
/// [`RelayError::is_fatal`] and [`RelayError::is_retryable`] at each
/// catch site.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad configuration or a malformed message.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The identity lock is held by another live process.
    #[error("another instance is already running (pid {pid})")]
    DuplicateInstance { pid: u32 },

    /// The persisted credential artifact is missing, stale, or rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Disconnects, rate limits and other transport hiccups.
    #[error("transport error: {0}")]
    TransientTransport(String),

    /// The content-processing collaborator failed.
    #[error("external service error: {0}")]
    ExternalService(String),

    /// A document exceeded the configured size limit.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// A source with the same id is already registered.
    #[error("source '{0}' is already registered")]
    DuplicateSource(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Startup-class errors terminate the process with a non-zero exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Validation(_)
                | RelayError::DuplicateInstance { .. }
                | RelayError::Authentication(_)
        )
    }

    /// Errors worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::TransientTransport(_) | RelayError::ExternalService(_)
        )
    }

    /// Short label used in status notifications.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "Validation",
            RelayError::DuplicateInstance { .. } => "Duplicate Instance",
            RelayError::Authentication(_) => "Authentication",
            RelayError::TransientTransport(_) => "Transport",
            RelayError::ExternalService(_) => "External Service",
            RelayError::ResourceLimit(_) => "Resource Limit",
            RelayError::DuplicateSource(_) => "Duplicate Source",
            RelayError::Io(_) => "I/O",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
