//! Type-safe identifiers for connections and routing.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Correlation Identifier
// ============================================================================

/// Client-supplied routing tag for a connection.
///
/// Taken from the `cid` query parameter at upgrade time and immutable for
/// the life of the connection. Events are delivered to every connection
/// whose correlation id equals the event's target field.
///
/// The value is not authenticated or validated. An empty correlation id is
/// accepted but never matches any target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a new CorrelationId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if an event targeting `target` should reach this id.
    ///
    /// Exact, case-sensitive comparison. Empty ids never match.
    #[must_use]
    pub fn matches(&self, target: &str) -> bool {
        !self.0.is_empty() && self.0 == target
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Connection Identifier
// ============================================================================

/// Server-generated handle for one registered connection.
///
/// Returned by registration and used for removal. Never reused, so a stale
/// handle cannot remove a newer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generates a fresh random connection id.
    pub fn new() -> Self {
        Self(format!("conn-{}", uuid::Uuid::new_v4()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 13 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..13).unwrap_or(&self.0)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Connection Role
// ============================================================================

/// Free-form role tag supplied by the client (e.g. "customer", "staff").
///
/// Informational only: it is logged but plays no part in routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Self(s)
    }
}
