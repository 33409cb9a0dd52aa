//! Lease identity types.
//!
//! A *local lease* is a short-lived grant from the cluster leader to this
//! node. The coordinator never inspects the epoch token it carries; it only
//! compares tokens, which is what fences activities across lease rotations.

use std::fmt;

use bytes::Bytes;

use crate::node::NodeId;

/// Opaque fencing token issued by whichever node granted a lease.
///
/// Equality is byte equality; the contents are never interpreted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct EpochToken(Bytes);

impl EpochToken {
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EpochToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EpochToken(")?;
        for byte in self.0.iter().take(8) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 8 {
            f.write_str("..")?;
        }
        f.write_str(")")
    }
}

/// A held local lease: the node it names and the epoch it was granted under.
///
/// Equality is structural, so a rotated epoch makes an otherwise identical
/// lease a different holder.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LeaseHolder {
    pub node: NodeId,
    pub epoch: EpochToken,
}

impl LeaseHolder {
    #[must_use]
    pub fn new(node: NodeId, epoch: EpochToken) -> Self {
        Self { node, epoch }
    }
}

impl fmt::Display for LeaseHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:?}", self.node, self.epoch)
    }
}

/// The lease identity an admission request requires.
///
/// Live activities only ever carry [`Leader`](Self::Leader) or
/// [`Holder`](Self::Holder); [`AnyLocal`](Self::AnyLocal) exists for
/// process registration and is resolved to the concrete holder at
/// admission.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LeaseExpectation {
    /// The local node must currently be the leader: the acquirer is
    /// registered and the local lease names this node.
    Leader,
    /// Any current local lease suffices.
    AnyLocal,
    /// The local lease must still be exactly this holder.
    Holder(LeaseHolder),
}

impl LeaseExpectation {
    /// Resolve against the current local lease into the expectation a live
    /// activity records. Returns `None` when `AnyLocal` finds no lease.
    #[must_use]
    pub fn resolve(&self, local: Option<&LeaseHolder>) -> Option<LeaseExpectation> {
        match self {
            Self::AnyLocal => local.cloned().map(Self::Holder),
            other => Some(other.clone()),
        }
    }
}

impl fmt::Display for LeaseExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => f.write_str("leader"),
            Self::AnyLocal => f.write_str("any local lease"),
            Self::Holder(holder) => write!(f, "lease {holder}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(node: &str, epoch: &[u8]) -> LeaseHolder {
        LeaseHolder::new(NodeId::from(node), EpochToken::new(epoch.to_vec()))
    }

    #[test]
    fn holder_equality_is_structural() {
        assert_eq!(holder("n1", b"e1"), holder("n1", b"e1"));
        assert_ne!(holder("n1", b"e1"), holder("n1", b"e2"));
        assert_ne!(holder("n1", b"e1"), holder("n2", b"e1"));
    }

    #[test]
    fn resolve_any_local_picks_current_holder() {
        let current = holder("n1", b"e1");
        assert_eq!(
            LeaseExpectation::AnyLocal.resolve(Some(&current)),
            Some(LeaseExpectation::Holder(current.clone()))
        );
        assert_eq!(LeaseExpectation::AnyLocal.resolve(None), None);
        assert_eq!(
            LeaseExpectation::Leader.resolve(None),
            Some(LeaseExpectation::Leader)
        );
        let pinned = LeaseExpectation::Holder(holder("n1", b"e0"));
        assert_eq!(pinned.resolve(Some(&current)), Some(pinned.clone()));
    }

    #[test]
    fn epoch_token_debug_truncates() {
        let token = EpochToken::new(vec![0xab; 12]);
        assert_eq!(format!("{token:?}"), "EpochToken(abababababababab..)");
    }
}
