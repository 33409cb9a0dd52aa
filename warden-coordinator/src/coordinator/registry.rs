//! Live-activity registry.
//!
//! One record per live activity, looked up by worker identity, by the
//! monitor's task id, or scanned by domain. The registry never leaves the
//! actor.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_core::{
    ActivityDescription, ActivityExit, ActivityId, ActivityName, ActivityOptions, Domain,
    DomainToken, LeaseExpectation, Quorum, ShutdownReason,
};

pub(crate) struct ActivityRecord {
    pub(crate) id: ActivityId,
    pub(crate) task: tokio::task::Id,
    pub(crate) abort: AbortHandle,
    pub(crate) domain: Domain,
    pub(crate) domain_token: DomainToken,
    pub(crate) name: Vec<ActivityName>,
    /// Resolved at admission; never `AnyLocal`.
    pub(crate) lease: LeaseExpectation,
    pub(crate) quorum: Quorum,
    pub(crate) options: ActivityOptions,
    pub(crate) cancel: CancellationToken,
    pub(crate) reason: Arc<OnceLock<ShutdownReason>>,
    /// `None` for adopted workers, which observe termination through
    /// their guard instead.
    pub(crate) exit: Option<oneshot::Sender<ActivityExit>>,
    /// When forced termination began; cleared once the worker is aborted.
    pub(crate) forced_at: Option<Instant>,
}

impl ActivityRecord {
    pub(crate) fn describe(&self) -> ActivityDescription {
        ActivityDescription {
            id: self.id,
            domain: self.domain.clone(),
            domain_token: self.domain_token,
            name: self.name.clone(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ActivityRegistry {
    records: Vec<ActivityRecord>,
}

impl ActivityRegistry {
    /// The live tree occupying `domain` under a different token, if any.
    /// All live activities within one domain share a single domain token.
    pub(crate) fn domain_conflict(
        &self,
        domain: &Domain,
        token: DomainToken,
    ) -> Option<ActivityDescription> {
        self.records
            .iter()
            .find(|record| record.domain == *domain && record.domain_token != token)
            .map(ActivityRecord::describe)
    }

    pub(crate) fn insert(&mut self, record: ActivityRecord) {
        self.records.push(record);
    }

    pub(crate) fn get_mut(&mut self, id: ActivityId) -> Option<&mut ActivityRecord> {
        self.records.iter_mut().find(|record| record.id == id)
    }

    pub(crate) fn remove(&mut self, id: ActivityId) -> Option<ActivityRecord> {
        let index = self.records.iter().position(|record| record.id == id)?;
        Some(self.records.remove(index))
    }

    pub(crate) fn id_for_task(&self, task: tokio::task::Id) -> Option<ActivityId> {
        self.records
            .iter()
            .find(|record| record.task == task)
            .map(|record| record.id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ActivityRecord> {
        self.records.iter()
    }

    pub(crate) fn take_all(&mut self) -> Vec<ActivityRecord> {
        std::mem::take(&mut self.records)
    }

    /// Earliest instant at which a force-terminated worker overstays its
    /// grace period.
    pub(crate) fn earliest_forced_deadline(&self, grace: Duration) -> Option<Instant> {
        self.records
            .iter()
            .filter_map(|record| record.forced_at)
            .map(|at| at + grace)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinSet;

    fn record(
        set: &mut JoinSet<ActivityId>,
        id: u64,
        domain: &str,
        token: DomainToken,
    ) -> ActivityRecord {
        let abort = set.spawn(std::future::pending());
        ActivityRecord {
            id: ActivityId(id),
            task: abort.id(),
            abort,
            domain: Domain::from(domain),
            domain_token: token,
            name: vec![ActivityName::from("t")],
            lease: LeaseExpectation::Leader,
            quorum: Quorum::Follower,
            options: ActivityOptions::default(),
            cancel: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            exit: None,
            forced_at: None,
        }
    }

    #[tokio::test]
    async fn same_token_shares_a_domain() {
        let mut set = JoinSet::new();
        let mut registry = ActivityRegistry::default();
        let token = DomainToken::fresh();
        registry.insert(record(&mut set, 1, "rebalance", token));
        registry.insert(record(&mut set, 2, "rebalance", token));

        assert!(registry.domain_conflict(&Domain::from("rebalance"), token).is_none());
    }

    #[tokio::test]
    async fn different_token_conflicts_within_a_domain() {
        let mut set = JoinSet::new();
        let mut registry = ActivityRegistry::default();
        let live = DomainToken::fresh();
        registry.insert(record(&mut set, 1, "rebalance", live));

        let competing = DomainToken::fresh();
        let existing = registry
            .domain_conflict(&Domain::from("rebalance"), competing)
            .expect("competing token must conflict");
        assert_eq!(existing.id, ActivityId(1));

        // A different domain is unaffected.
        assert!(registry.domain_conflict(&Domain::from("compaction"), competing).is_none());
    }

    #[tokio::test]
    async fn lookup_by_id_and_task() {
        let mut set = JoinSet::new();
        let mut registry = ActivityRegistry::default();
        let token = DomainToken::fresh();
        registry.insert(record(&mut set, 1, "a", token));
        registry.insert(record(&mut set, 2, "b", token));

        let task = registry.get_mut(ActivityId(2)).expect("record 2").task;
        assert_eq!(registry.id_for_task(task), Some(ActivityId(2)));

        let removed = registry.remove(ActivityId(1)).expect("record 1");
        assert_eq!(removed.id, ActivityId(1));
        assert!(registry.remove(ActivityId(1)).is_none());
        assert_eq!(registry.iter().count(), 1);
    }

    #[tokio::test]
    async fn forced_deadline_tracks_earliest() {
        let mut set = JoinSet::new();
        let mut registry = ActivityRegistry::default();
        let token = DomainToken::fresh();
        registry.insert(record(&mut set, 1, "a", token));
        registry.insert(record(&mut set, 2, "b", token));

        let grace = Duration::from_secs(5);
        assert!(registry.earliest_forced_deadline(grace).is_none());

        let early = Instant::now();
        registry.get_mut(ActivityId(2)).expect("record").forced_at = Some(early);
        registry.get_mut(ActivityId(1)).expect("record").forced_at =
            Some(early + Duration::from_secs(1));
        assert_eq!(registry.earliest_forced_deadline(grace), Some(early + grace));
    }
}
