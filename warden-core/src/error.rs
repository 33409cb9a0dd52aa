//! Structured coordinator errors.
//!
//! [`ActivityError`] is the `error_stack` context for every fallible
//! coordinator operation. Variants carry enough state for callers to act
//! on them programmatically; match on `Report::current_context` (the
//! coordinator crate re-exports `error_stack`).

use std::collections::BTreeSet;
use std::fmt;

use crate::activity::{ActivityId, ActivityName, Domain, DomainToken, ShutdownReason, name_path};
use crate::collaborator::{CollaboratorId, Role};
use crate::lease::{LeaseExpectation, LeaseHolder};
use crate::node::NodeId;
use crate::quorum::Quorum;

/// Identifies a live activity in errors and status snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityDescription {
    pub id: ActivityId,
    pub domain: Domain,
    pub domain_token: DomainToken,
    pub name: Vec<ActivityName>,
}

impl fmt::Display for ActivityDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" ({})",
            self.domain,
            name_path(&self.name),
            self.id
        )
    }
}

/// Coordinator error.
#[derive(Debug)]
pub enum ActivityError {
    /// Admission timed out before the quorum predicate held. Carries the
    /// requirement and the lease state observed at the timeout.
    NoQuorum {
        required_lease: LeaseExpectation,
        required_quorum: Quorum,
        local_lease: Option<LeaseHolder>,
        remote_leases: BTreeSet<NodeId>,
    },
    /// Another activity tree is live in the requested domain.
    DomainConflict {
        requested: DomainToken,
        existing: ActivityDescription,
    },
    /// A nested request named a different domain than its parent token.
    DomainMismatch { requested: Domain, token: Domain },
    /// The role's registration slot is already occupied.
    AlreadyRegistered { role: Role, expected: CollaboratorId },
    /// A lease event arrived from a worker that is not the registered
    /// collaborator for that role.
    WrongProcess {
        role: Role,
        supplied: CollaboratorId,
        expected: Option<CollaboratorId>,
    },
    /// A lease grant or expiry that contradicts the currently held lease.
    InvalidLeaseTransition {
        event: &'static str,
        held: Option<LeaseHolder>,
    },
    /// The activity was admitted and then force-terminated.
    ActivityFailed {
        domain: Domain,
        name: Vec<ActivityName>,
        reason: ShutdownReason,
    },
    /// The activity worker panicked or its monitor was lost.
    WorkerLost {
        domain: Domain,
        name: Vec<ActivityName>,
    },
    /// Anonymous activity bodies cannot be shipped to another node.
    NonLocalBody { target: NodeId },
    /// Switch-quorum named a worker that is no longer live.
    NoSuchActivity { id: ActivityId },
    /// The caller's total wait bound elapsed.
    Timeout,
    /// The coordinator has shut down.
    Shutdown,
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityError::NoQuorum {
                required_lease,
                required_quorum,
                local_lease,
                remote_leases,
            } => {
                write!(
                    f,
                    "no quorum: required {required_lease} and {required_quorum}, \
                     observed local lease {:?} and {} remote lease(s)",
                    local_lease,
                    remote_leases.len()
                )
            }
            ActivityError::DomainConflict { requested, existing } => {
                write!(
                    f,
                    "domain conflict: token {requested} competes with live activity {existing}"
                )
            }
            ActivityError::DomainMismatch { requested, token } => {
                write!(
                    f,
                    "nested activity domain {requested} does not match parent domain {token}"
                )
            }
            ActivityError::AlreadyRegistered { role, expected } => {
                write!(f, "{role} already registered as {expected}")
            }
            ActivityError::WrongProcess {
                role,
                supplied,
                expected,
            } => {
                write!(
                    f,
                    "{role} event from {supplied}, expected {}",
                    expected.map_or_else(|| "no registration".to_owned(), |id| id.to_string())
                )
            }
            ActivityError::InvalidLeaseTransition { event, held } => {
                write!(f, "invalid {event} while holding {held:?}")
            }
            ActivityError::ActivityFailed {
                domain,
                name,
                reason,
            } => {
                write!(
                    f,
                    "activity {domain} \"{}\" shut down: {reason}",
                    name_path(name)
                )
            }
            ActivityError::WorkerLost { domain, name } => {
                write!(f, "activity {domain} \"{}\" worker lost", name_path(name))
            }
            ActivityError::NonLocalBody { target } => {
                write!(
                    f,
                    "cannot ship an anonymous activity body to remote node {target}"
                )
            }
            ActivityError::NoSuchActivity { id } => {
                write!(f, "no live activity {id}")
            }
            ActivityError::Timeout => f.write_str("timed out waiting for the coordinator"),
            ActivityError::Shutdown => f.write_str("coordinator has shut down"),
        }
    }
}

impl std::error::Error for ActivityError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::QuorumLoss;

    #[test]
    fn no_quorum_display_names_requirements() {
        let err = ActivityError::NoQuorum {
            required_lease: LeaseExpectation::Leader,
            required_quorum: Quorum::Majority,
            local_lease: None,
            remote_leases: BTreeSet::new(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("leader"));
        assert!(rendered.contains("majority"));
        assert!(rendered.contains("0 remote lease(s)"));
    }

    #[test]
    fn activity_failed_display_names_path_and_reason() {
        let err = ActivityError::ActivityFailed {
            domain: Domain::from("rebalance"),
            name: vec![ActivityName::from("move"), ActivityName::from("vb12")],
            reason: ShutdownReason::QuorumLost(QuorumLoss::LeaseLost(NodeId::from("n2"))),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("rebalance"));
        assert!(rendered.contains("move.vb12"));
        assert!(rendered.contains("lease on n2 lost"));
    }

    #[test]
    fn is_std_error() {
        let _: &dyn std::error::Error = &ActivityError::Timeout;
    }
}
