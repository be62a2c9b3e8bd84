//! Error types for the `adk-retrieval` crate.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in retrieval operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// Missing or invalid setup: an unsupported chunk mode, an unusable
    /// embedding function, a refiner template without its placeholders,
    /// nothing to rerank, and similar.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A collection or document was required but does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A collection or document already exists and the caller disallowed
    /// replacing or reusing it.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// An embedding backend, vector database or language model was
    /// unreachable or returned an error.
    #[error("External service error ({service}): {message}")]
    ExternalService {
        /// The service that produced the error.
        service: String,
        /// A description of the failure.
        message: String,
    },

    /// A source document could not be read.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path being read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A payload could not be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl RagError {
    /// Build an [`RagError::ExternalService`] error.
    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService { service: service.into(), message: message.into() }
    }

    /// Returns `true` for [`RagError::Configuration`].
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns `true` for [`RagError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` for [`RagError::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Returns `true` for [`RagError::ExternalService`].
    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalService { .. })
    }
}

/// A convenience result type for retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;
