use burrow_core::error::CoreError;
use burrow_relay::error::RelayError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TunnelErrorKind {
    #[error("{0}")]
    CoreError(CoreError),
    #[error("{0}")]
    RelayError(RelayError),
    #[error("Tunnel setup timed out")]
    TunnelTimeout,
    #[error("Tunnel setup failed: {0}")]
    TunnelConnectFailed(RelayError),
    #[error("I/O error from Tokio")]
    IoError,
    #[error("Tokio task error")]
    TaskError,
    #[error("Tokio mpsc channel error")]
    ChannelError,
}

#[derive(Debug, Clone)]
pub struct TunnelError {
    pub error_kind: TunnelErrorKind,
    pub message: String,
}

impl Display for TunnelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.error_kind {
            TunnelErrorKind::CoreError(e) => write!(f, "Tunnel Error -> {}", e),
            TunnelErrorKind::RelayError(e) => write!(f, "Tunnel Error -> {}", e),
            _ => write!(f, "Tunnel Error: {}: {}", self.error_kind, self.message),
        }
    }
}

impl Error for TunnelError {}

impl TunnelError {
    pub fn new(error_kind: TunnelErrorKind, message: &str) -> Self {
        Self {
            error_kind,
            message: message.to_owned(),
        }
    }
}

impl From<CoreError> for TunnelError {
    fn from(value: CoreError) -> Self {
        Self::new(TunnelErrorKind::CoreError(value), "")
    }
}

impl From<RelayError> for TunnelError {
    fn from(value: RelayError) -> Self {
        Self::new(TunnelErrorKind::RelayError(value), "")
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(value: std::io::Error) -> Self {
        Self::new(TunnelErrorKind::IoError, value.to_string().as_str())
    }
}

impl From<tokio::task::JoinError> for TunnelError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::new(TunnelErrorKind::TaskError, value.to_string().as_str())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for TunnelError {
    fn from(value: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::new(TunnelErrorKind::ChannelError, value.to_string().as_str())
    }
}
