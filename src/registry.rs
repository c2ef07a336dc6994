//! Identity registry
//!
//! Tracks which package identities have already been materialized during
//! a run so a package referenced by several manifests is built once.

use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
pub struct IdentityRegistry {
    seen: HashSet<String>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Has this identity already been materialized?
    pub fn contains(&self, identity: &str) -> bool {
        self.seen.contains(identity)
    }

    /// Record an identity. Returns false if it was already present.
    pub fn claim(&mut self, identity: &str) -> bool {
        self.seen.insert(identity.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
