//! Lease- and quorum-gated activity coordination for a cluster node.
//!
//! The coordinator gates administrative operations ("activities") on two
//! preconditions: the node holds a valid short-lived local lease from the
//! current leader, and a quorum of remote leases is held at the moment the
//! activity is admitted. It then supervises the running activities and
//! cancels them whenever either precondition stops holding.
//!
//! # Architecture
//!
//! A single background actor owns all mutable state; the cloneable
//! [`Coordinator`] handle ships requests to it over channels. Two
//! in-process collaborators push lease transitions in: the *agent*
//! (accepts local lease grants) and the *acquirer* (holds remote leases
//! while this node leads). Activity bodies run on their own tasks and
//! receive an explicit [`ActivityContext`] for nested coordinator calls.
//!
//! # Typical flow
//!
//! 1. [`Coordinator::spawn`] with the node id and a settings watch.
//! 2. The lease collaborators call [`Coordinator::register_agent`] /
//!    [`Coordinator::register_acquirer`] and report lease transitions.
//! 3. Cluster code runs gated operations through
//!    [`Coordinator::run_activity`] or adopts long-lived service workers
//!    with [`Coordinator::register_process`].
//!
//! # Key types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Coordinator`] | Handle to the background actor |
//! | [`ActivityContext`] | Per-activity context threaded into bodies |
//! | [`ActivityHandle`] | Monitored handle to an async activity |
//! | [`OrchestrationSettings`] | Runtime knobs, including the bypass switch |

#![warn(clippy::pedantic)]

pub mod config;
pub(crate) mod coordinator;

pub use config::{CompatVersion, MIN_ORCHESTRATION_COMPAT, OrchestrationSettings};
pub use coordinator::{
    ActivityContext, ActivityGuard, ActivityHandle, CollaboratorGuard, Coordinator,
    CoordinatorStatus, RegisteredActivity,
};

pub use error_stack;
