//! Activity identity, options, and the propagated activity token.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::collaborator::Role;
use crate::lease::LeaseExpectation;
use crate::node::NodeId;

/// Mutual-exclusion class for activities (e.g. `rebalance`).
///
/// At most one activity tree per domain is live at a time.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Domain({})", self.0)
    }
}

impl From<&str> for Domain {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifies one activity tree within a domain.
///
/// Nested activities share their parent's token; competing top-level
/// starts mint fresh ones, which is how the coordinator tells them apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainToken([u8; 16]);

impl DomainToken {
    /// Mint a fresh random token.
    #[must_use]
    pub fn fresh() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for DomainToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DomainToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainToken({self})")
    }
}

/// One segment of an activity's name path.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ActivityName(Arc<str>);

impl ActivityName {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActivityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ActivityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivityName({})", self.0)
    }
}

impl From<&str> for ActivityName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Renders a name path as `outer.inner` for logs and errors.
#[must_use]
pub fn name_path(names: &[ActivityName]) -> String {
    let mut out = String::new();
    for (i, name) in names.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        out.push_str(name.as_str());
    }
    out
}

/// Worker identity of a live activity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ActivityId(pub u64);

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-request knobs. Timeouts fall back to the coordinator's configured
/// defaults when unset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivityOptions {
    /// Max time to wait for the admission predicate.
    pub quorum_timeout: Option<Duration>,
    /// Caller's total wait bound for the admission exchange.
    pub timeout: Option<Duration>,
    /// Suppress the log line on normal termination.
    pub quiet: bool,
    /// Admit on quorum timeout if the lease and leadership preconditions
    /// still hold. Tri-state: `None` inherits the parent activity's
    /// setting, so a nested request can explicitly opt back into safety.
    pub unsafe_admission: Option<bool>,
}

impl ActivityOptions {
    /// Fill unset inheritable options from the parent. The unsafe flag is
    /// the only one that propagates.
    #[must_use]
    pub fn inherit(mut self, parent: &ActivityOptions) -> Self {
        if self.unsafe_admission.is_none() {
            self.unsafe_admission = parent.unsafe_admission;
        }
        self
    }

    /// Whether the unsafe-timeout escape hatch is on.
    #[must_use]
    pub fn is_unsafe(&self) -> bool {
        self.unsafe_admission.unwrap_or(false)
    }
}

/// Context propagated into an activity's execution so nested activities
/// re-enter the coordinator under the same tree.
#[derive(Clone, Debug)]
pub struct ActivityToken {
    /// The lease the outer activity was admitted under. Nested admission
    /// checks against *this*, not the current local lease, which fences
    /// out lease rotations mid-activity.
    pub lease: LeaseExpectation,
    pub domain: Domain,
    pub domain_token: DomainToken,
    /// Name path from the outermost activity down to this one.
    pub name: Vec<ActivityName>,
    /// This activity's options; only the unsafe flag propagates to
    /// children.
    pub options: ActivityOptions,
}

impl ActivityToken {
    /// Token minted for a caller not currently inside an activity: empty
    /// name path, fresh random domain token.
    #[must_use]
    pub fn fresh(lease: LeaseExpectation, domain: Domain) -> Self {
        Self {
            lease,
            domain,
            domain_token: DomainToken::fresh(),
            name: Vec::new(),
            options: ActivityOptions::default(),
        }
    }

    /// Derive the token for a nested activity: same tree, name appended,
    /// inheritable options filled in.
    #[must_use]
    pub fn child(&self, name: ActivityName, options: ActivityOptions) -> Self {
        let mut path = self.name.clone();
        path.push(name);
        Self {
            lease: self.lease.clone(),
            domain: self.domain.clone(),
            domain_token: self.domain_token,
            name: path,
            options: options.inherit(&self.options),
        }
    }
}

/// Why the coordinator force-terminated an activity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The local lease expired or the lease agent died.
    LocalLeaseExpired,
    /// The activity's quorum stopped holding.
    QuorumLost(QuorumLoss),
    /// A collaborator the activity's leadership requirement depended on
    /// died.
    LeaderProcessDied(Role),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::LocalLeaseExpired => f.write_str("local lease expired"),
            ShutdownReason::QuorumLost(loss) => write!(f, "quorum lost: {loss}"),
            ShutdownReason::LeaderProcessDied(role) => write!(f, "{role} process died"),
        }
    }
}

/// What broke an activity's quorum.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QuorumLoss {
    /// The acquirer reported the remote lease on this node lost.
    LeaseLost(NodeId),
    /// The quorum-node set changed under the activity.
    MembershipChanged,
}

impl fmt::Display for QuorumLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumLoss::LeaseLost(node) => write!(f, "lease on {node} lost"),
            QuorumLoss::MembershipChanged => f.write_str("membership changed"),
        }
    }
}

/// How an activity worker exited, as observed through its monitor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivityExit {
    /// The body ran to completion or unwound after a parent cancellation.
    Completed,
    /// The coordinator force-terminated the activity.
    Terminated(ShutdownReason),
    /// The worker panicked or its monitor was lost.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tokens_differ_per_tree() {
        let a = ActivityToken::fresh(LeaseExpectation::Leader, Domain::default());
        let b = ActivityToken::fresh(LeaseExpectation::Leader, Domain::default());
        assert_ne!(a.domain_token, b.domain_token);
        assert!(a.name.is_empty());
    }

    #[test]
    fn child_appends_name_and_keeps_tree() {
        let root = ActivityToken::fresh(LeaseExpectation::Leader, Domain::from("rebalance"));
        let child = root
            .child(ActivityName::from("move"), ActivityOptions::default())
            .child(ActivityName::from("backfill"), ActivityOptions::default());
        assert_eq!(child.domain_token, root.domain_token);
        assert_eq!(child.domain, root.domain);
        assert_eq!(name_path(&child.name), "move.backfill");
    }

    #[test]
    fn unsafe_flag_is_inherited() {
        let parent = ActivityOptions {
            unsafe_admission: Some(true),
            quiet: true,
            quorum_timeout: Some(Duration::from_secs(1)),
            ..ActivityOptions::default()
        };
        let inherited = ActivityOptions::default().inherit(&parent);
        assert!(inherited.is_unsafe());
        // Nothing else propagates.
        assert!(!inherited.quiet);
        assert_eq!(inherited.quorum_timeout, None);
    }

    #[test]
    fn child_can_override_unsafe_to_be_stricter() {
        let parent = ActivityOptions {
            unsafe_admission: Some(true),
            ..ActivityOptions::default()
        };
        let strict = ActivityOptions {
            unsafe_admission: Some(false),
            ..ActivityOptions::default()
        };
        assert!(!strict.inherit(&parent).is_unsafe());
    }

    #[test]
    fn unsafe_inheritance_through_token_chain() {
        let mut root = ActivityToken::fresh(LeaseExpectation::Leader, Domain::default());
        root.options.unsafe_admission = Some(true);
        let child = root.child(ActivityName::from("x"), ActivityOptions::default());
        assert!(child.options.is_unsafe());
        let grandchild = child.child(ActivityName::from("y"), ActivityOptions::default());
        assert!(grandchild.options.is_unsafe());
    }

    #[test]
    fn name_path_rendering() {
        assert_eq!(name_path(&[]), "");
        assert_eq!(
            name_path(&[ActivityName::from("a"), ActivityName::from("b")]),
            "a.b"
        );
    }
}
