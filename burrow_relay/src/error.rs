use burrow_core::error::CoreError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RelayErrorKind {
    #[error("{0}")]
    CoreError(CoreError),
    #[error("The relay denied access to the target")]
    AccessDenied,
    #[error("Connecting to the relay failed")]
    ConnectFailed,
    #[error("Resuming the relay session failed")]
    ReconnectFailed,
    #[error("Relay protocol violation")]
    ProtocolViolation,
    #[error("Unacknowledged data exceeded the buffer ceiling")]
    BufferOverflow,
    #[error("Relay stream error")]
    StreamError,
    #[error("The relay connection is closed")]
    ConnectionClosed,
    #[error("Timeout error")]
    TimeoutError,
}

#[derive(Debug, Clone)]
pub struct RelayError {
    pub error_kind: RelayErrorKind,
    pub message: String,
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.error_kind {
            RelayErrorKind::CoreError(e) => write!(f, "Relay Error -> {}", e),
            _ => write!(f, "Relay Error: {}: {}", self.error_kind, self.message),
        }
    }
}

impl Error for RelayError {}

impl RelayError {
    pub fn new(error_kind: RelayErrorKind, message: &str) -> Self {
        Self {
            error_kind,
            message: message.to_owned(),
        }
    }

    /// Transport-level failures that the connection may resume from; every
    /// other kind is terminal for the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.error_kind, RelayErrorKind::StreamError)
    }
}

impl From<CoreError> for RelayError {
    fn from(value: CoreError) -> Self {
        Self::new(RelayErrorKind::CoreError(value), "")
    }
}

impl From<tokio::time::error::Elapsed> for RelayError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        Self::new(RelayErrorKind::TimeoutError, value.to_string().as_str())
    }
}
