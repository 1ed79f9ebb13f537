pub mod diff;
pub mod findings;
pub mod review;

pub use diff::*;
pub use findings::*;
pub use review::*;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Newtype for commit SHA to avoid mixing it up with other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitSha(pub String);

impl CommitSha {
    /// Returns a truncated SHA for display (first 7 characters).
    pub fn short(&self) -> &str {
        &self.0[..7.min(self.0.len())]
    }
}

impl fmt::Display for CommitSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CommitSha {
    fn from(s: String) -> Self {
        CommitSha(s)
    }
}

impl From<&str> for CommitSha {
    fn from(s: &str) -> Self {
        CommitSha(s.to_string())
    }
}
