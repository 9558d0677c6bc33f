// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

use thiserror::Error;

use crucible_protocol::{ErrorBody, ErrorKind};
use crucible_store_core::store_path::{ParseStorePathError, StorePathNameError};

pub type DaemonResult<T> = Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("invalid store path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Name(#[from] StorePathNameError),

    #[error("store path not found: {0}")]
    NotFound(String),

    #[error("content mismatch for '{path}': {detail}")]
    ContentMismatch { path: String, detail: String },

    #[error("import conflicts with existing object '{path}': {detail}")]
    Conflict { path: String, detail: String },

    #[error("failed to parse derivation '{path}': {detail}")]
    DerivationParse { path: String, detail: String },

    #[error("builder for '{drv_path}' failed with exit code {exit}")]
    BuildFailed { drv_path: String, exit: i32 },

    #[error("build of '{0}' timed out")]
    TimedOut(String),

    #[error("build of '{0}' was canceled")]
    Canceled(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("upstream build failed: {0}")]
    Upstream(ErrorBody),

    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Db(#[from] crucible_store_db::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl DaemonError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        DaemonError::Io {
            message: message.into(),
            source,
        }
    }

    /// The protocol-level error this maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::InvalidPath(_) => ErrorKind::InvalidPath,
            DaemonError::Name(StorePathNameError::NameTooShort) => ErrorKind::NameTooShort,
            DaemonError::Name(StorePathNameError::NameTooLong(_)) => ErrorKind::NameTooLong,
            DaemonError::Name(StorePathNameError::NameBadChars(..)) => ErrorKind::NameBadChars,
            DaemonError::NotFound(_) => ErrorKind::NotFound,
            DaemonError::ContentMismatch { .. } => ErrorKind::ContentMismatch,
            DaemonError::Conflict { .. } => ErrorKind::Conflict,
            DaemonError::DerivationParse { .. } => ErrorKind::DerivationParse,
            DaemonError::BuildFailed { .. } => ErrorKind::BuildFailed,
            DaemonError::TimedOut(_) => ErrorKind::TimedOut,
            DaemonError::Canceled(_) => ErrorKind::Canceled,
            DaemonError::Sandbox(_) => ErrorKind::SandboxError,
            DaemonError::Upstream(body) => body.kind,
            DaemonError::Io { .. } => ErrorKind::Io,
            DaemonError::Db(_) => ErrorKind::Io,
            DaemonError::Config(_) | DaemonError::Toml(_) => ErrorKind::Io,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.kind(), self.to_string())
    }
}

impl From<ParseStorePathError> for DaemonError {
    fn from(err: ParseStorePathError) -> Self {
        match err {
            ParseStorePathError::Name(name_err) => DaemonError::Name(name_err),
            other => DaemonError::InvalidPath(other.to_string()),
        }
    }
}

/// Attach a message to IO errors on the way up.
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> DaemonResult<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> DaemonResult<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| DaemonError::io(f(), e))
    }
}
