//! Typed identifiers shared across conductor components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable execution (job) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable worker (shard-owning server) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(
    /// Raw server name.
    pub String,
);

impl WorkerId {
    /// Borrow the raw server name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        WorkerId(value.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        WorkerId(value)
    }
}
