//! Error types for the stream supervisor.
//!
//! Only startup conditions are fatal; everything here is recovered per source
//! or per tick by the caller and logged.

use crate::source::SourceId;
use std::path::PathBuf;
use thiserror::Error;

/// A source descriptor that cannot be streamed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("source {0} has no connection URI")]
    MissingUri(SourceId),

    #[error("source {id} has a malformed connection URI: {reason}")]
    MalformedUri { id: SourceId, reason: String },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("failed to prepare segment directory {path:?}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("insufficient system memory ({0} KB available)")]
    InsufficientMemory(u64),

    #[error("failed to spawn transcoder for source {id}: {source}")]
    Spawn {
        id: SourceId,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry data is invalid: {0}")]
    Parse(String),
}
