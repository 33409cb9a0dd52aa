//! Collaborator identity.
//!
//! The coordinator accepts exactly two in-process collaborators: the
//! *agent* (accepts local lease grants from the current leader) and the
//! *acquirer* (drives remote lease acquisition while this node leads).

use std::fmt;

/// The two collaborator roles with a registration slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Agent,
    Acquirer,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Acquirer => "acquirer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a registered collaborator worker, checked on every lease
/// event it reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollaboratorId(pub u64);

impl fmt::Display for CollaboratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
