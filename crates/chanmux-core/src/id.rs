//! Identifiers for peers and topics.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Identity a peer supplies in the first frame of its connection.
///
/// At most one live connection is registered per `PeerId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a PeerId without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a raw identity frame, trimming surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EmptyPeerId` if nothing is left after trimming.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DomainError::EmptyPeerId);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the named lock guarding this peer's I/O path.
    #[must_use]
    pub fn io_lock_key(&self) -> String {
        format!("{}.io", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A publish/subscribe topic label.
///
/// Topics are case-insensitive: the name is lowercased on construction so
/// `"Temps"` and `"temps"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Creates a normalized topic.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().to_lowercase())
    }

    /// Creates a normalized topic, rejecting blank names.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EmptyTopic` for empty or whitespace-only names.
    pub fn parse(name: &str) -> DomainResult<Self> {
        if name.trim().is_empty() {
            return Err(DomainError::EmptyTopic);
        }
        Ok(Self::new(name))
    }

    /// Returns the normalized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
