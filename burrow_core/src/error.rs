use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::AddrParseError;
use std::num::ParseIntError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CoreErrorKind {
    #[error("Frame encoding error")]
    EncodingError,
    #[error("Frame exceeds the maximum chunk size")]
    FrameTooLarge,
    #[error("Malformed frame")]
    MalformedFrame,
    #[error("Address parse error")]
    ParseAddrError,
    #[error("I/O error from Tokio")]
    IoError,
    #[error("Timeout error")]
    TimeoutError,
    #[error("Tokio task error")]
    TaskError,
    #[error("Tokio mpsc channel error")]
    TokioMpscChannelError,
    #[error("Tokio oneshot channel error")]
    TokioOneshotChannelError,
    #[error("Credential error")]
    CredentialError,
    #[error("Target resolution error")]
    ResolveError,
}

#[derive(Debug, Clone)]
pub struct CoreError {
    pub error_kind: CoreErrorKind,
    pub message: String,
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Core Error: {}: {}", self.error_kind, self.message)
    }
}

impl Error for CoreError {}

impl CoreError {
    pub fn new(error_kind: CoreErrorKind, message: &str) -> Self {
        Self {
            error_kind,
            message: message.to_owned(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(value: std::io::Error) -> Self {
        Self::new(CoreErrorKind::IoError, value.to_string().as_str())
    }
}

impl From<AddrParseError> for CoreError {
    fn from(value: AddrParseError) -> Self {
        Self::new(CoreErrorKind::ParseAddrError, value.to_string().as_str())
    }
}

impl From<ParseIntError> for CoreError {
    fn from(value: ParseIntError) -> Self {
        Self::new(CoreErrorKind::ParseAddrError, value.to_string().as_str())
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        Self::new(CoreErrorKind::TimeoutError, value.to_string().as_str())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::new(CoreErrorKind::TaskError, value.to_string().as_str())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CoreError {
    fn from(value: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::new(
            CoreErrorKind::TokioMpscChannelError,
            value.to_string().as_str(),
        )
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CoreError {
    fn from(value: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::new(
            CoreErrorKind::TokioOneshotChannelError,
            value.to_string().as_str(),
        )
    }
}
