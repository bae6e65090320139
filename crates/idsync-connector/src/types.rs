//! Connector enums and status types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of provisioning operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create a new object in the target system
    Create,
    /// Update an existing object in the target system
    Update,
    /// Delete an object from the target system
    Delete,
}

impl OperationKind {
    /// All kinds, in dispatch order.
    #[must_use]
    pub fn all() -> &'static [OperationKind] {
        &[
            OperationKind::Create,
            OperationKind::Update,
            OperationKind::Delete,
        ]
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    /// The connector capability this kind is dispatched to.
    #[must_use]
    pub fn required_capability(&self) -> Capability {
        match self {
            OperationKind::Create => Capability::Create,
            OperationKind::Update => Capability::Update,
            OperationKind::Delete => Capability::Delete,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ParseOperationKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            _ => Err(ParseOperationKindError(s.to_string())),
        }
    }
}

/// Error parsing operation kind from string.
#[derive(Debug, Clone)]
pub struct ParseOperationKindError(String);

impl fmt::Display for ParseOperationKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid operation kind '{}', expected one of: create, update, delete",
            self.0
        )
    }
}

impl std::error::Error for ParseOperationKindError {}

/// Circuit breaker state as seen by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Operations are processed normally
    #[default]
    Closed,
    /// Operations are short-circuited until the block window elapses
    Open,
    /// Block window elapsed, one probe is allowed through
    HalfOpen,
}

impl CircuitState {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Check if operations may be attempted at all.
    #[must_use]
    pub fn allows_operations(&self) -> bool {
        matches!(self, CircuitState::Closed | CircuitState::HalfOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = ParseCircuitStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half_open" => Ok(CircuitState::HalfOpen),
            _ => Err(ParseCircuitStateError(s.to_string())),
        }
    }
}

/// Error parsing circuit state from string.
#[derive(Debug, Clone)]
pub struct ParseCircuitStateError(String);

impl fmt::Display for ParseCircuitStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid circuit state '{}', expected one of: closed, open, half_open",
            self.0
        )
    }
}

impl std::error::Error for ParseCircuitStateError {}

/// A single connector capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Create,
    Read,
    Update,
    Delete,
    Search,
    Schema,
}

impl Capability {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Create => "create",
            Capability::Read => "read",
            Capability::Update => "update",
            Capability::Delete => "delete",
            Capability::Search => "search",
            Capability::Schema => "schema",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Capability::Create => 1,
            Capability::Read => 1 << 1,
            Capability::Update => 1 << 2,
            Capability::Delete => 1 << 3,
            Capability::Search => 1 << 4,
            Capability::Schema => 1 << 5,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The set of capabilities a connector instance exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// An empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Add a capability, builder style.
    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.0 |= capability.bit();
        self
    }

    /// Check membership.
    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Iterate over the contained capabilities.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        [
            Capability::Create,
            Capability::Read,
            Capability::Update,
            Capability::Delete,
            Capability::Search,
            Capability::Schema,
        ]
        .into_iter()
        .filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        iter.into_iter().fold(Self::empty(), CapabilitySet::with)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
