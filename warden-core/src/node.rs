//! Cluster node identity.

use std::fmt;
use std::sync::Arc;

/// Name of a cluster node.
///
/// Cheap to clone; ordering and hashing follow the name so ids can key
/// ordered sets.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_name() {
        let a = NodeId::from("n1");
        let b = NodeId::from("n2");
        assert!(a < b);
        assert_eq!(a, NodeId::new("n1".to_owned()));
    }

    #[test]
    fn display_is_bare_name() {
        assert_eq!(NodeId::from("n7").to_string(), "n7");
    }
}
