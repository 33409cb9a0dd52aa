//! Quorum expressions and their pure evaluation.

use std::collections::BTreeSet;
use std::fmt;

use crate::node::NodeId;

/// Which remote acknowledgements an activity needs before it may proceed.
///
/// `All` and `Majority` without an explicit node set are evaluated against
/// the coordinator's current quorum-node set; a `Compound` list is a
/// conjunction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Quorum {
    /// Every quorum node holds a remote lease.
    All,
    /// Strictly more than half of the quorum nodes hold a remote lease.
    Majority,
    /// No remote requirement; only the local lease must exist.
    Follower,
    /// `All`, evaluated against this explicit node set. An empty set is
    /// trivially satisfied.
    AllOf(BTreeSet<NodeId>),
    /// `Majority`, evaluated against this explicit node set. An empty set
    /// is never satisfied (0 > 0 is false).
    MajorityOf(BTreeSet<NodeId>),
    /// Conjunction of quorum expressions.
    Compound(Vec<Quorum>),
}

impl Quorum {
    /// True unless the expression is `Follower` or a conjunction whose
    /// every element does not require leadership.
    #[must_use]
    pub fn requires_leader(&self) -> bool {
        match self {
            Quorum::Follower => false,
            Quorum::Compound(parts) => parts.iter().any(Quorum::requires_leader),
            _ => true,
        }
    }

    /// Flatten nested conjunctions. Done once at admission so repeated
    /// re-evaluation works on a flat expression.
    #[must_use]
    pub fn normalize(self) -> Self {
        match self {
            Quorum::Compound(parts) => {
                let mut flat = Vec::with_capacity(parts.len());
                for part in parts {
                    match part.normalize() {
                        Quorum::Compound(inner) => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                if flat.len() == 1 {
                    flat.remove(0)
                } else {
                    Quorum::Compound(flat)
                }
            }
            other => other,
        }
    }

    /// Evaluate against the currently held remote leases and the current
    /// quorum-node set.
    #[must_use]
    pub fn is_met(&self, held: &BTreeSet<NodeId>, quorum_nodes: &BTreeSet<NodeId>) -> bool {
        match self {
            Quorum::Follower => true,
            Quorum::All => quorum_nodes.is_subset(held),
            Quorum::AllOf(nodes) => nodes.is_subset(held),
            Quorum::Majority => majority_holds(quorum_nodes, held),
            Quorum::MajorityOf(nodes) => majority_holds(nodes, held),
            Quorum::Compound(parts) => parts.iter().all(|part| part.is_met(held, quorum_nodes)),
        }
    }
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quorum::All => f.write_str("all"),
            Quorum::Majority => f.write_str("majority"),
            Quorum::Follower => f.write_str("follower"),
            Quorum::AllOf(nodes) => write!(f, "all of {}", node_list(nodes)),
            Quorum::MajorityOf(nodes) => write!(f, "majority of {}", node_list(nodes)),
            Quorum::Compound(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" and ")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
        }
    }
}

fn node_list(nodes: &BTreeSet<NodeId>) -> String {
    let mut out = String::from("[");
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(node.as_str());
    }
    out.push(']');
    out
}

/// Strictly more than half: `2 * held > total`, so an empty node set is
/// never a majority.
fn majority_holds(nodes: &BTreeSet<NodeId>, held: &BTreeSet<NodeId>) -> bool {
    let holding = nodes.intersection(held).count();
    holding * 2 > nodes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
        names.iter().map(|name| NodeId::from(*name)).collect()
    }

    #[test]
    fn majority_of_three_needs_two() {
        let members = nodes(&["n1", "n2", "n3"]);
        assert!(!Quorum::Majority.is_met(&nodes(&["n1"]), &members));
        assert!(Quorum::Majority.is_met(&nodes(&["n1", "n2"]), &members));
    }

    #[test]
    fn majority_of_two_needs_both() {
        let members = nodes(&["n1", "n2"]);
        assert!(!Quorum::Majority.is_met(&nodes(&["n1"]), &members));
        assert!(Quorum::Majority.is_met(&nodes(&["n1", "n2"]), &members));
    }

    #[test]
    fn majority_of_one_needs_that_node() {
        let members = nodes(&["n1"]);
        assert!(!Quorum::Majority.is_met(&nodes(&[]), &members));
        assert!(Quorum::Majority.is_met(&nodes(&["n1"]), &members));
    }

    #[test]
    fn majority_of_empty_set_is_never_satisfied() {
        let empty = nodes(&[]);
        assert!(!Quorum::MajorityOf(empty.clone()).is_met(&nodes(&["n1"]), &nodes(&["n1"])));
        assert!(!Quorum::Majority.is_met(&nodes(&["n1"]), &empty));
    }

    #[test]
    fn all_of_empty_set_is_trivially_satisfied() {
        assert!(Quorum::AllOf(nodes(&[])).is_met(&nodes(&[]), &nodes(&["n1"])));
    }

    #[test]
    fn all_requires_every_member() {
        let members = nodes(&["n1", "n2", "n3"]);
        assert!(!Quorum::All.is_met(&nodes(&["n1", "n2"]), &members));
        assert!(Quorum::All.is_met(&nodes(&["n1", "n2", "n3"]), &members));
    }

    #[test]
    fn explicit_sets_ignore_quorum_nodes() {
        let members = nodes(&["n1", "n2", "n3", "n4", "n5"]);
        let explicit = Quorum::MajorityOf(nodes(&["n1", "n2"]));
        // Majority over the explicit pair needs both, regardless of the
        // wider membership.
        assert!(!explicit.is_met(&nodes(&["n1"]), &members));
        assert!(explicit.is_met(&nodes(&["n1", "n2"]), &members));
    }

    #[test]
    fn follower_needs_no_remote_leases() {
        assert!(Quorum::Follower.is_met(&nodes(&[]), &nodes(&["n1", "n2"])));
    }

    #[test]
    fn compound_is_a_conjunction() {
        let members = nodes(&["n1", "n2", "n3"]);
        let quorum = Quorum::Compound(vec![
            Quorum::Majority,
            Quorum::AllOf(nodes(&["n3"])),
        ]);
        assert!(!quorum.is_met(&nodes(&["n1", "n2"]), &members));
        assert!(quorum.is_met(&nodes(&["n1", "n3"]), &members));
    }

    #[test]
    fn requires_leader_classification() {
        assert!(Quorum::All.requires_leader());
        assert!(Quorum::Majority.requires_leader());
        assert!(Quorum::MajorityOf(nodes(&[])).requires_leader());
        assert!(!Quorum::Follower.requires_leader());
        assert!(!Quorum::Compound(vec![Quorum::Follower]).requires_leader());
        assert!(!Quorum::Compound(vec![]).requires_leader());
        assert!(Quorum::Compound(vec![Quorum::Follower, Quorum::Majority]).requires_leader());
    }

    #[test]
    fn normalize_flattens_nested_conjunctions() {
        let quorum = Quorum::Compound(vec![
            Quorum::Compound(vec![Quorum::Majority, Quorum::Follower]),
            Quorum::All,
        ]);
        assert_eq!(
            quorum.normalize(),
            Quorum::Compound(vec![Quorum::Majority, Quorum::Follower, Quorum::All])
        );
    }

    #[test]
    fn normalize_unwraps_singleton_conjunction() {
        let quorum = Quorum::Compound(vec![Quorum::Compound(vec![Quorum::Majority])]);
        assert_eq!(quorum.normalize(), Quorum::Majority);
    }
}
