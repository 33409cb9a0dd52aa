//! The coordinator actor.
//!
//! A single-threaded serializer: every mutation of the collaborator
//! slots, the lease sets, the activity registry, and the deferred-wait
//! queue happens inside this task, one message at a time. Admission
//! predicate evaluation, state mutation, and sub-call dispatch are one
//! indivisible step per message, which is what makes the lease/quorum
//! invariants enforceable.
//!
//! Activity bodies run on their own tasks; the actor only supervises
//! them through a `JoinSet` of monitors. The `biased` select polls
//! cancellation, monitors, and collaborator control events ahead of
//! admission traffic so lease transitions are processed promptly under
//! load.

use std::collections::BTreeSet;
use std::time::Duration;

use error_stack::Report;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use warden_core::{
    ActivityError, ActivityExit, ActivityId, CollaboratorId, LeaseExpectation, LeaseHolder,
    NodeId, Quorum, QuorumLoss, Role, ShutdownReason, name_path,
};

use super::registry::{ActivityRecord, ActivityRegistry};
use super::{
    AdmissionCall, AdmissionRequest, AdoptProcess, Control, CoordinatorStatus, Request,
    StartActivity,
};

/// How long a force-terminated worker gets to confirm exit before its
/// monitor is torn down.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

struct Waiter {
    lease: LeaseExpectation,
    quorum: Quorum,
    unsafe_admission: bool,
    deadline: Instant,
    call: AdmissionCall,
}

struct CollaboratorSlot {
    id: CollaboratorId,
}

pub(super) struct CoordinatorActor {
    local_node: NodeId,
    control_rx: mpsc::Receiver<Control>,
    request_rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,

    agent: Option<CollaboratorSlot>,
    acquirer: Option<CollaboratorSlot>,
    local_lease: Option<LeaseHolder>,
    remote_leases: BTreeSet<NodeId>,
    quorum_nodes: BTreeSet<NodeId>,

    registry: ActivityRegistry,
    workers: JoinSet<ActivityId>,
    monitors: JoinSet<(Role, CollaboratorId)>,
    waiters: Vec<Waiter>,
    next_collaborator: u64,
}

impl CoordinatorActor {
    pub(super) fn new(
        local_node: NodeId,
        control_rx: mpsc::Receiver<Control>,
        request_rx: mpsc::Receiver<Request>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            local_node,
            control_rx,
            request_rx,
            cancel,
            agent: None,
            acquirer: None,
            local_lease: None,
            remote_leases: BTreeSet::new(),
            quorum_nodes: BTreeSet::new(),
            registry: ActivityRegistry::default(),
            workers: JoinSet::new(),
            monitors: JoinSet::new(),
            waiters: Vec::new(),
            next_collaborator: 0,
        }
    }

    pub(super) async fn run(mut self) {
        tracing::debug!(node = %self.local_node, "coordinator actor started");

        loop {
            let next_deadline = self.next_deadline();
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                Some(result) = self.workers.join_next(), if !self.workers.is_empty() => {
                    self.on_worker_exit(result);
                }

                Some(result) = self.monitors.join_next(), if !self.monitors.is_empty() => {
                    if let Ok((role, id)) = result {
                        self.on_collaborator_down(role, id);
                    }
                }

                Some(control) = self.control_rx.recv() => {
                    self.handle_control(control);
                }

                Some(request) = self.request_rx.recv() => {
                    self.handle_request(request);
                }

                () = tokio::time::sleep_until(next_deadline.unwrap_or_else(far_future)),
                    if next_deadline.is_some() =>
                {
                    self.handle_deadlines();
                }
            }
        }

        self.teardown().await;
    }

    async fn teardown(mut self) {
        for waiter in std::mem::take(&mut self.waiters) {
            Self::refuse(waiter.call, Report::new(ActivityError::Shutdown));
        }
        for record in self.registry.take_all() {
            record.cancel.cancel();
        }
        self.workers.shutdown().await;
        self.monitors.shutdown().await;
        tracing::debug!(node = %self.local_node, "coordinator actor stopped");
    }

    // --- predicate -----------------------------------------------------

    /// Leader means: the acquirer is registered and the local lease names
    /// this node.
    fn is_leader(&self) -> bool {
        self.acquirer.is_some()
            && self
                .local_lease
                .as_ref()
                .is_some_and(|holder| holder.node == self.local_node)
    }

    fn have_lease(&self, lease: &LeaseExpectation) -> bool {
        match lease {
            LeaseExpectation::Leader => self.is_leader(),
            LeaseExpectation::AnyLocal => self.local_lease.is_some(),
            LeaseExpectation::Holder(holder) => self.local_lease.as_ref() == Some(holder),
        }
    }

    fn admissible(&self, lease: &LeaseExpectation, quorum: &Quorum, check_quorum: bool) -> bool {
        self.have_lease(lease)
            && (!quorum.requires_leader() || self.is_leader())
            && (!check_quorum || quorum.is_met(&self.remote_leases, &self.quorum_nodes))
    }

    fn record_predicate_holds(&self, record: &ActivityRecord) -> bool {
        self.have_lease(&record.lease)
            && (!record.quorum.requires_leader() || self.is_leader())
            && record.quorum.is_met(&self.remote_leases, &self.quorum_nodes)
    }

    fn no_quorum(&self, lease: LeaseExpectation, quorum: Quorum) -> Report<ActivityError> {
        Report::new(ActivityError::NoQuorum {
            required_lease: lease,
            required_quorum: quorum,
            local_lease: self.local_lease.clone(),
            remote_leases: self.remote_leases.clone(),
        })
    }

    // --- admission -----------------------------------------------------

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Admission(admission) => self.admit(admission),
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn admit(&mut self, request: AdmissionRequest) {
        if self.admissible(&request.lease, &request.quorum, true) {
            self.dispatch(request.lease, request.quorum, request.call);
        } else {
            self.waiters.push(Waiter {
                deadline: Instant::now() + request.quorum_timeout,
                lease: request.lease,
                quorum: request.quorum,
                unsafe_admission: request.unsafe_admission,
                call: request.call,
            });
        }
    }

    /// Re-run the predicate for deferred requests, dispatching the
    /// satisfied ones in registration order. Dispatching one cannot
    /// invalidate another's predicate, so a single pass suffices.
    fn dispatch_waiters(&mut self) {
        let mut kept = Vec::with_capacity(self.waiters.len());
        for waiter in std::mem::take(&mut self.waiters) {
            if self.admissible(&waiter.lease, &waiter.quorum, true) {
                self.dispatch(waiter.lease, waiter.quorum, waiter.call);
            } else {
                kept.push(waiter);
            }
        }
        kept.append(&mut self.waiters);
        self.waiters = kept;
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();

        let mut kept = Vec::with_capacity(self.waiters.len());
        for waiter in std::mem::take(&mut self.waiters) {
            if waiter.deadline > now {
                kept.push(waiter);
            } else if waiter.unsafe_admission
                && self.admissible(&waiter.lease, &waiter.quorum, false)
            {
                // Degraded admission: the lease and leadership conditions
                // still hold, so proceed without the remote quorum.
                tracing::warn!(quorum = %waiter.quorum, "unsafe admission after quorum timeout");
                self.dispatch(waiter.lease, waiter.quorum, waiter.call);
            } else {
                let err = self.no_quorum(waiter.lease, waiter.quorum);
                Self::refuse(waiter.call, err);
            }
        }
        kept.append(&mut self.waiters);
        self.waiters = kept;

        // Workers that did not confirm exit within the grace period lose
        // their monitor.
        let overdue: Vec<ActivityId> = self
            .registry
            .iter()
            .filter(|record| {
                record
                    .forced_at
                    .is_some_and(|at| now >= at + TERMINATE_GRACE)
            })
            .map(|record| record.id)
            .collect();
        for id in overdue {
            if let Some(record) = self.registry.get_mut(id) {
                tracing::warn!(
                    activity = record.id.0,
                    domain = %record.domain,
                    "worker did not confirm exit within grace; aborting its monitor"
                );
                record.abort.abort();
                record.forced_at = None;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let waiter = self.waiters.iter().map(|waiter| waiter.deadline).min();
        let grace = self.registry.earliest_forced_deadline(TERMINATE_GRACE);
        match (waiter, grace) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn refuse(call: AdmissionCall, err: Report<ActivityError>) {
        match call {
            AdmissionCall::Start(start) => {
                let _ = start.reply.send(Err(err));
            }
            AdmissionCall::Adopt(adopt) => {
                let _ = adopt.reply.send(Err(err));
            }
            AdmissionCall::Switch { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Execute an admitted sub-call. Runs inside the same actor step as
    /// the predicate evaluation that approved it.
    fn dispatch(&mut self, lease: LeaseExpectation, quorum: Quorum, call: AdmissionCall) {
        let Some(admitted_lease) = lease.resolve(self.local_lease.as_ref()) else {
            let err = self.no_quorum(lease, quorum);
            Self::refuse(call, err);
            return;
        };

        match call {
            AdmissionCall::Start(start) => self.dispatch_start(admitted_lease, quorum, start),
            AdmissionCall::Adopt(adopt) => self.dispatch_adopt(admitted_lease, quorum, adopt),
            AdmissionCall::Switch { id, quorum: new_quorum, reply } => {
                let result = match self.registry.get_mut(id) {
                    Some(record) => {
                        record.quorum = new_quorum;
                        Ok(())
                    }
                    None => Err(Report::new(ActivityError::NoSuchActivity { id })),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn dispatch_start(&mut self, lease: LeaseExpectation, quorum: Quorum, start: StartActivity) {
        let StartActivity {
            token,
            id,
            worker,
            cancel,
            reason,
            exit,
            reply,
        } = start;

        if let Some(existing) = self.registry.domain_conflict(&token.domain, token.domain_token) {
            let _ = reply.send(Err(Report::new(ActivityError::DomainConflict {
                requested: token.domain_token,
                existing,
            })));
            return;
        }

        tracing::debug!(
            activity = id.0,
            domain = %token.domain,
            name = %name_path(&token.name),
            "activity started"
        );

        let abort = self.workers.spawn(async move {
            worker.await;
            id
        });
        self.registry.insert(ActivityRecord {
            id,
            task: abort.id(),
            abort,
            domain: token.domain.clone(),
            domain_token: token.domain_token,
            name: token.name.clone(),
            lease,
            quorum,
            options: token.options,
            cancel,
            reason,
            exit: Some(exit),
            forced_at: None,
        });
        let _ = reply.send(Ok(()));
    }

    fn dispatch_adopt(&mut self, lease: LeaseExpectation, quorum: Quorum, adopt: AdoptProcess) {
        let AdoptProcess {
            mut token,
            id,
            monitor,
            cancel,
            reason,
            reply,
        } = adopt;

        if let Some(existing) = self.registry.domain_conflict(&token.domain, token.domain_token) {
            let _ = reply.send(Err(Report::new(ActivityError::DomainConflict {
                requested: token.domain_token,
                existing,
            })));
            return;
        }

        token.lease = lease.clone();

        tracing::debug!(
            activity = id.0,
            domain = %token.domain,
            name = %name_path(&token.name),
            "process adopted as activity"
        );

        let abort = self.workers.spawn(async move {
            let _ = monitor.await;
            id
        });
        self.registry.insert(ActivityRecord {
            id,
            task: abort.id(),
            abort,
            domain: token.domain.clone(),
            domain_token: token.domain_token,
            name: token.name.clone(),
            lease,
            quorum,
            options: token.options.clone(),
            cancel,
            reason,
            exit: None,
            forced_at: None,
        });
        let _ = reply.send(Ok(token));
    }

    // --- supervision ---------------------------------------------------

    fn on_worker_exit(&mut self, result: Result<ActivityId, JoinError>) {
        let (id, panicked) = match result {
            Ok(id) => (id, false),
            Err(err) => {
                // Aborted or panicked before yielding its id; map the task
                // back to the record.
                let Some(id) = self.registry.id_for_task(err.id()) else {
                    return;
                };
                (id, err.is_panic())
            }
        };
        let Some(record) = self.registry.remove(id) else {
            return;
        };

        let exit = if let Some(reason) = record.reason.get() {
            ActivityExit::Terminated(reason.clone())
        } else if panicked {
            ActivityExit::Failed
        } else {
            ActivityExit::Completed
        };

        match &exit {
            ActivityExit::Completed if record.options.quiet => {}
            ActivityExit::Completed => {
                tracing::info!(
                    activity = record.id.0,
                    domain = %record.domain,
                    name = %name_path(&record.name),
                    "activity completed"
                );
            }
            ActivityExit::Terminated(reason) => {
                tracing::warn!(
                    activity = record.id.0,
                    domain = %record.domain,
                    name = %name_path(&record.name),
                    %reason,
                    "activity terminated"
                );
            }
            ActivityExit::Failed => {
                tracing::warn!(
                    activity = record.id.0,
                    domain = %record.domain,
                    name = %name_path(&record.name),
                    "activity worker failed"
                );
            }
        }

        if let Some(exit_tx) = record.exit {
            let _ = exit_tx.send(exit);
        }
    }

    /// Terminate-and-wait: record the reason, signal the worker, and let
    /// the monitor (bounded by [`TERMINATE_GRACE`]) confirm the exit.
    fn terminate(&mut self, id: ActivityId, reason: ShutdownReason) {
        if let Some(record) = self.registry.get_mut(id)
            && record.forced_at.is_none()
        {
            tracing::info!(
                activity = record.id.0,
                domain = %record.domain,
                name = %name_path(&record.name),
                %reason,
                "terminating activity"
            );
            let _ = record.reason.set(reason);
            record.forced_at = Some(Instant::now());
            record.cancel.cancel();
        }
    }

    fn terminate_all(&mut self, reason: ShutdownReason) {
        let ids: Vec<ActivityId> = self.registry.iter().map(|record| record.id).collect();
        for id in ids {
            self.terminate(id, reason.clone());
        }
    }

    fn terminate_where(
        &mut self,
        mut pred: impl FnMut(&ActivityRecord) -> bool,
        reason: ShutdownReason,
    ) {
        let ids: Vec<ActivityId> = self
            .registry
            .iter()
            .filter(|record| pred(record))
            .map(|record| record.id)
            .collect();
        for id in ids {
            self.terminate(id, reason.clone());
        }
    }

    /// Invariant sweep: every live activity must still satisfy
    /// `have_lease ∧ have_quorum`; the rest are terminated with `reason`.
    fn reevaluate_activities(&mut self, reason: ShutdownReason) {
        let failing: Vec<ActivityId> = self
            .registry
            .iter()
            .filter(|record| !self.record_predicate_holds(record))
            .map(|record| record.id)
            .collect();
        for id in failing {
            self.terminate(id, reason.clone());
        }
    }

    // --- collaborators -------------------------------------------------

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::RegisterCollaborator { role, monitor, reply } => {
                let result = self.register_collaborator(role, monitor);
                let registered = result.is_ok();
                let _ = reply.send(result);
                if registered {
                    // A fresh acquirer can flip the leadership predicate.
                    self.dispatch_waiters();
                }
            }
            Control::LeaseAcquired { from, node, reply } => {
                let _ = reply.send(self.lease_acquired(from, node));
            }
            Control::LeaseLost { from, node, reply } => {
                let _ = reply.send(self.lease_lost(from, node));
            }
            Control::LocalLeaseGranted { from, holder, reply } => {
                let _ = reply.send(self.local_lease_granted(from, holder));
            }
            Control::LocalLeaseExpired { from, holder, reply } => {
                let _ = reply.send(self.local_lease_expired(from, holder));
            }
            Control::MembershipChanged { nodes, reply } => {
                self.membership_changed(nodes);
                let _ = reply.send(());
            }
        }
    }

    fn register_collaborator(
        &mut self,
        role: Role,
        monitor: oneshot::Receiver<()>,
    ) -> Result<CollaboratorId, Report<ActivityError>> {
        let occupied = match role {
            Role::Agent => self.agent.as_ref(),
            Role::Acquirer => self.acquirer.as_ref(),
        };
        if let Some(existing) = occupied {
            return Err(Report::new(ActivityError::AlreadyRegistered {
                role,
                expected: existing.id,
            }));
        }

        self.next_collaborator += 1;
        let id = CollaboratorId(self.next_collaborator);
        let slot = CollaboratorSlot { id };
        match role {
            Role::Agent => self.agent = Some(slot),
            Role::Acquirer => self.acquirer = Some(slot),
        }
        self.monitors.spawn(async move {
            let _ = monitor.await;
            (role, id)
        });
        tracing::debug!(%role, collaborator = id.0, "collaborator registered");
        Ok(id)
    }

    fn check_collaborator(
        &self,
        role: Role,
        supplied: CollaboratorId,
    ) -> Result<(), Report<ActivityError>> {
        let expected = match role {
            Role::Agent => self.agent.as_ref(),
            Role::Acquirer => self.acquirer.as_ref(),
        }
        .map(|slot| slot.id);
        if expected == Some(supplied) {
            Ok(())
        } else {
            Err(Report::new(ActivityError::WrongProcess {
                role,
                supplied,
                expected,
            }))
        }
    }

    fn on_collaborator_down(&mut self, role: Role, id: CollaboratorId) {
        let current = match role {
            Role::Agent => self.agent.as_ref(),
            Role::Acquirer => self.acquirer.as_ref(),
        };
        // A monitor from a superseded registration has nothing to say.
        if !current.is_some_and(|slot| slot.id == id) {
            return;
        }

        match role {
            Role::Agent => {
                self.agent = None;
                self.local_lease = None;
                tracing::warn!("lease agent died; local lease forfeited");
                self.terminate_all(ShutdownReason::LocalLeaseExpired);
            }
            Role::Acquirer => {
                self.acquirer = None;
                self.remote_leases.clear();
                tracing::warn!("lease acquirer died; remote leases forfeited");
                self.terminate_where(
                    |record| record.quorum.requires_leader(),
                    ShutdownReason::LeaderProcessDied(Role::Acquirer),
                );
            }
        }
    }

    // --- lease and membership events -----------------------------------

    fn lease_acquired(
        &mut self,
        from: CollaboratorId,
        node: NodeId,
    ) -> Result<(), Report<ActivityError>> {
        self.check_collaborator(Role::Acquirer, from)?;
        if self.remote_leases.insert(node.clone()) {
            tracing::debug!(%node, "remote lease acquired");
            self.dispatch_waiters();
        }
        Ok(())
    }

    fn lease_lost(
        &mut self,
        from: CollaboratorId,
        node: NodeId,
    ) -> Result<(), Report<ActivityError>> {
        self.check_collaborator(Role::Acquirer, from)?;
        if self.remote_leases.remove(&node) {
            tracing::debug!(%node, "remote lease lost");
            self.reevaluate_activities(ShutdownReason::QuorumLost(QuorumLoss::LeaseLost(node)));
        }
        Ok(())
    }

    fn local_lease_granted(
        &mut self,
        from: CollaboratorId,
        holder: LeaseHolder,
    ) -> Result<(), Report<ActivityError>> {
        self.check_collaborator(Role::Agent, from)?;
        if let Some(held) = &self.local_lease {
            // One grant per expiry cycle.
            tracing::error!(%held, granted = %holder, "lease granted while one is held");
            return Err(Report::new(ActivityError::InvalidLeaseTransition {
                event: "local_lease_granted",
                held: Some(held.clone()),
            }));
        }
        tracing::debug!(node = %holder.node, "local lease granted");
        self.local_lease = Some(holder);
        self.dispatch_waiters();
        Ok(())
    }

    fn local_lease_expired(
        &mut self,
        from: CollaboratorId,
        holder: LeaseHolder,
    ) -> Result<(), Report<ActivityError>> {
        self.check_collaborator(Role::Agent, from)?;
        if self.local_lease.as_ref() != Some(&holder) {
            tracing::error!(
                held = ?self.local_lease,
                expired = %holder,
                "expiry does not name the held lease"
            );
            return Err(Report::new(ActivityError::InvalidLeaseTransition {
                event: "local_lease_expired",
                held: self.local_lease.clone(),
            }));
        }
        tracing::debug!(node = %holder.node, "local lease expired");
        self.local_lease = None;
        self.terminate_all(ShutdownReason::LocalLeaseExpired);
        Ok(())
    }

    fn membership_changed(&mut self, nodes: BTreeSet<NodeId>) {
        if nodes == self.quorum_nodes {
            return;
        }
        tracing::debug!(count = nodes.len(), "quorum node set changed");
        self.quorum_nodes = nodes;
        self.reevaluate_activities(ShutdownReason::QuorumLost(QuorumLoss::MembershipChanged));
        self.dispatch_waiters();
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            local_lease: self.local_lease.clone(),
            remote_leases: self.remote_leases.clone(),
            quorum_nodes: self.quorum_nodes.clone(),
            activities: self.registry.iter().map(ActivityRecord::describe).collect(),
            agent: self.agent.as_ref().map(|slot| slot.id),
            acquirer: self.acquirer.as_ref().map(|slot| slot.id),
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}
