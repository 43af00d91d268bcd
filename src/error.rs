use burrow_core::error::CoreError;
use burrow_relay::error::RelayError;
use burrow_tunnel::error::TunnelError;
use std::fmt::{Debug, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AppErrorKind {
    #[error("{0}")]
    CoreError(#[from] CoreError),
    #[error("{0}")]
    RelayError(#[from] RelayError),
    #[error("{0}")]
    TunnelError(#[from] TunnelError),
    #[error("Invalid arguments")]
    ArgumentError,
    #[error("I/O error from Tokio")]
    IoError,
}

#[derive(Error, Clone)]
pub struct AppError {
    pub error_kind: AppErrorKind,
    pub message: String,
}

impl Debug for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.error_kind {
            AppErrorKind::CoreError(e) => write!(f, "AppError -> {}", e),
            AppErrorKind::RelayError(e) => write!(f, "AppError -> {}", e),
            AppErrorKind::TunnelError(e) => write!(f, "AppError -> {}", e),
            _ => write!(f, "AppError: {}: {}", self.error_kind, self.message),
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.error_kind {
            AppErrorKind::CoreError(e) => write!(f, "AppError -> {}", e),
            AppErrorKind::RelayError(e) => write!(f, "AppError -> {}", e),
            AppErrorKind::TunnelError(e) => write!(f, "AppError -> {}", e),
            _ => write!(f, "AppError: {}: {}", self.error_kind, self.message),
        }
    }
}

impl AppError {
    pub fn new(error_kind: AppErrorKind, message: &str) -> Self {
        Self {
            error_kind,
            message: message.to_owned(),
        }
    }
}

impl From<CoreError> for AppError {
    fn from(value: CoreError) -> Self {
        Self::new(AppErrorKind::CoreError(value), "")
    }
}

impl From<RelayError> for AppError {
    fn from(value: RelayError) -> Self {
        Self::new(AppErrorKind::RelayError(value), "")
    }
}

impl From<TunnelError> for AppError {
    fn from(value: TunnelError) -> Self {
        Self::new(AppErrorKind::TunnelError(value), "")
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::new(AppErrorKind::IoError, value.to_string().as_str())
    }
}
