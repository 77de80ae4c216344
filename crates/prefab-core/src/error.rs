//! Error types for Prefab

use crate::resource::ResourceKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("setup failed: {context}: {source}")]
    Setup {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command `{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("command `{command}` timed out after {secs}s")]
    CommandTimeout { command: String, secs: u64 },

    #[error("{kind} {name}: {source}")]
    ApplyFailed {
        kind: ResourceKind,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid locator {locator}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("invalid manifest {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn setup(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Setup {
            context: context.into(),
            source,
        }
    }

    pub fn command_failed(
        command: impl Into<String>,
        status: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            status: status.into(),
            output: output.into(),
        }
    }

    pub fn apply_failed(kind: ResourceKind, name: impl Into<String>, source: Error) -> Self {
        Self::ApplyFailed {
            kind,
            name: name.into(),
            source: Box::new(source),
        }
    }

    pub fn invalid_locator(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocator {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
