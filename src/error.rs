//! Error types for the registry engine

use std::fmt;

use thiserror::Error;

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Entry {key} is not available in {registry}{}", format_neighbors(.neighbors))]
    NotAvailable {
        registry: String,
        key: String,
        /// Closest existing keys under the key ordering, as a lookup hint
        neighbors: Vec<String>,
    },

    #[error("Entry {key} already exists in {registry}")]
    AlreadyExists { registry: String, key: String },

    #[error("Verification of {key} in {registry} failed: {reason}")]
    VerificationFailed {
        registry: String,
        key: String,
        reason: String,
    },

    #[error("Write access to {registry} rejected: {reason}")]
    Rejected { registry: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("Fatal implementation error in {registry}: {message}{}", format_causes(.causes))]
    FatalImplementation {
        registry: String,
        message: String,
        causes: Vec<RegistryError>,
    },

    #[error("Lock acquisition on {registry} was interrupted")]
    Interrupted { registry: String },

    #[error("Registry {registry} is shut down")]
    ShutDown { registry: String },
}

impl RegistryError {
    /// Build a `VerificationFailed` error, the usual payload of a failed handler verdict
    pub fn verification(
        registry: impl Into<String>,
        key: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::VerificationFailed {
            registry: registry.into(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Build a `Rejected` error
    pub fn rejected(registry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            registry: registry.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is an aggregate of several causes
    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi(_))
    }

    /// Whether this error reports a broken assumption rather than bad input
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalImplementation { .. })
    }
}

/// Aggregate of several independent failures
///
/// Produced by `remove_all`, by consistency runs that stop converging and by
/// synchronizer phases. Every cause is rendered by `Display`.
#[derive(Debug)]
pub struct MultiError {
    message: String,
    causes: Vec<RegistryError>,
}

impl MultiError {
    pub fn new(message: impl Into<String>, causes: Vec<RegistryError>) -> Self {
        Self {
            message: message.into(),
            causes,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn causes(&self) -> &[RegistryError] {
        &self.causes
    }

    pub fn into_causes(self) -> Vec<RegistryError> {
        self.causes
    }

    pub fn len(&self) -> usize {
        self.causes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.message, format_causes(&self.causes))
    }
}

impl std::error::Error for MultiError {}

fn format_neighbors(neighbors: &[String]) -> String {
    if neighbors.is_empty() {
        String::new()
    } else {
        format!(" (nearest keys: {})", neighbors.join(", "))
    }
}

fn format_causes(causes: &[RegistryError]) -> String {
    causes
        .iter()
        .enumerate()
        .map(|(i, cause)| format!("\n  {}. {}", i + 1, cause))
        .collect()
}
