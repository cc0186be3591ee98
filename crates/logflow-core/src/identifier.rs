//! Stream and topic identifiers.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a named identifier in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

/// Reference to a stream, topic or consumer: either a positive number or a name.
///
/// Two identifiers are equal only when they have the same kind and value, so
/// `Numeric(1)` never equals `Named("1")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceIdentifier {
    /// Numeric identifier (always > 0)
    Numeric(u32),
    /// Named identifier (non-empty, at most 255 bytes)
    Named(String),
}

impl ResourceIdentifier {
    /// Create a numeric identifier.
    pub fn numeric(id: u32) -> Result<Self> {
        if id == 0 {
            return Err(Error::Config("Numeric identifier must be positive".into()));
        }
        Ok(Self::Numeric(id))
    }

    /// Create a named identifier.
    pub fn named(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Config("Identifier name cannot be empty".into()));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(Error::Config(format!(
                "Identifier name exceeds {} bytes: {}",
                MAX_NAME_LENGTH,
                name.len()
            )));
        }
        Ok(Self::Named(name))
    }

    /// Check the invariants of an identifier built through the enum directly
    /// (for example by deserialization).
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Numeric(id) => Self::numeric(*id).map(|_| ()),
            Self::Named(name) => Self::named(name.as_str()).map(|_| ()),
        }
    }

    /// Get the numeric value, if this is a numeric identifier.
    pub fn as_numeric(&self) -> Option<u32> {
        match self {
            Self::Numeric(id) => Some(*id),
            Self::Named(_) => None,
        }
    }

    /// Get the name, if this is a named identifier.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Numeric(_) => None,
            Self::Named(name) => Some(name),
        }
    }

    /// Whether this identifier refers to a resource with the given id and name.
    pub fn matches(&self, id: u32, name: &str) -> bool {
        match self {
            Self::Numeric(value) => *value == id,
            Self::Named(value) => value == name,
        }
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{}", id),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Parses digits as a numeric identifier and anything else as a name.
impl FromStr for ResourceIdentifier {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.parse::<u32>() {
            Ok(id) => Self::numeric(id),
            Err(_) => Self::named(value),
        }
    }
}
