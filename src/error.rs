// src/error.rs

use std::fmt;
use thiserror::Error;

/// The three subsystems an environment spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    Dns,
    Database,
    Container,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Dns => "dns",
            Backend::Database => "database",
            Backend::Container => "container",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a single backend adapter call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The store was rewritten but the resolver did not confirm the reload.
    #[error("record changed, reload unconfirmed: {0}")]
    ReloadUnconfirmed(String),

    #[error("persistent home volume missing: {0}")]
    VolumeMissing(String),

    /// An adapter-internal rollback failed and left the resource in an unknown shape.
    #[error("rollback failed: {0}")]
    CompensationFailed(String),

    #[error("invalid input: {0}")]
    Invalid(String),
}

impl BackendError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    /// `AlreadyExists` and `NotFound` are outcomes the orchestrator plans for.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::AlreadyExists(_) | Self::NotFound(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ResourceConflict(_) => ErrorKind::ResourceConflict,
            Self::Unavailable(_) | Self::ReloadUnconfirmed(_) | Self::VolumeMissing(_) => {
                ErrorKind::BackendUnavailable
            }
            Self::CompensationFailed(_) => ErrorKind::CompensationFailed,
            Self::Invalid(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// Operator-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    ResourceConflict,
    BackendUnavailable,
    CompensationFailed,
    InvalidArgument,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ResourceConflict => "ResourceConflict",
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::CompensationFailed => "CompensationFailed",
            ErrorKind::InvalidArgument => "InvalidArgument",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup configuration errors. The agent refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0} is required")]
    Missing(&'static str),
}
