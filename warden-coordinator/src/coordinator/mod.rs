//! Coordinator handle and public operations.
//!
//! ```text
//! Coordinator (handle, cloneable)
//!   ├─► control channel ──► CoordinatorActor (owns all state)
//!   ├─► request channel ─┘        ├─► activity worker[0]
//!   │                             ├─► activity worker[1]
//!   │                             └─► collaborator monitors
//!   └─► settings (watch, read per call)
//! ```
//!
//! All mutations happen inside the background actor; the handle only ships
//! requests and waits on oneshot replies. Collaborator lease events travel
//! on a separate control channel that the actor polls before admission
//! requests, so lease and membership transitions are never starved by
//! activity traffic.
//!
//! Activity bodies hold the channel half of the handle only (no
//! lifecycle state), so live workers never keep the actor alive once
//! every external handle is gone.

mod actor;
mod registry;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use error_stack::Report;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_core::{
    ActivityDescription, ActivityError, ActivityExit, ActivityId, ActivityName, ActivityOptions,
    ActivityToken, CollaboratorId, Domain, LeaseExpectation, LeaseHolder, NodeId, Quorum, Role,
    ShutdownReason,
};

use crate::config::OrchestrationSettings;
use actor::CoordinatorActor;

/// An admission request: the inputs of the conditional quorum wait plus
/// the sub-call to dispatch once the predicate holds.
struct AdmissionRequest {
    lease: LeaseExpectation,
    quorum: Quorum,
    unsafe_admission: bool,
    quorum_timeout: Duration,
    call: AdmissionCall,
}

enum AdmissionCall {
    Start(StartActivity),
    Adopt(AdoptProcess),
    Switch {
        id: ActivityId,
        quorum: Quorum,
        reply: oneshot::Sender<Result<(), Report<ActivityError>>>,
    },
}

struct StartActivity {
    token: ActivityToken,
    id: ActivityId,
    worker: BoxFuture<'static, ()>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
    exit: oneshot::Sender<ActivityExit>,
    reply: oneshot::Sender<Result<(), Report<ActivityError>>>,
}

struct AdoptProcess {
    token: ActivityToken,
    id: ActivityId,
    monitor: oneshot::Receiver<()>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
    reply: oneshot::Sender<Result<ActivityToken, Report<ActivityError>>>,
}

enum Request {
    Admission(AdmissionRequest),
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
}

enum Control {
    RegisterCollaborator {
        role: Role,
        monitor: oneshot::Receiver<()>,
        reply: oneshot::Sender<Result<CollaboratorId, Report<ActivityError>>>,
    },
    LeaseAcquired {
        from: CollaboratorId,
        node: NodeId,
        reply: oneshot::Sender<Result<(), Report<ActivityError>>>,
    },
    LeaseLost {
        from: CollaboratorId,
        node: NodeId,
        reply: oneshot::Sender<Result<(), Report<ActivityError>>>,
    },
    LocalLeaseGranted {
        from: CollaboratorId,
        holder: LeaseHolder,
        reply: oneshot::Sender<Result<(), Report<ActivityError>>>,
    },
    LocalLeaseExpired {
        from: CollaboratorId,
        holder: LeaseHolder,
        reply: oneshot::Sender<Result<(), Report<ActivityError>>>,
    },
    MembershipChanged {
        nodes: BTreeSet<NodeId>,
        reply: oneshot::Sender<()>,
    },
}

/// Point-in-time snapshot of coordinator state.
#[derive(Clone, Debug)]
pub struct CoordinatorStatus {
    pub local_lease: Option<LeaseHolder>,
    pub remote_leases: BTreeSet<NodeId>,
    pub quorum_nodes: BTreeSet<NodeId>,
    pub activities: Vec<ActivityDescription>,
    pub agent: Option<CollaboratorId>,
    pub acquirer: Option<CollaboratorId>,
}

/// The channel half of the handle: everything an activity body needs for
/// nested calls, and nothing that pins the actor's lifetime.
#[derive(Clone)]
#[derive(Debug)]
struct CoordinatorCore {
    local_node: NodeId,
    settings: watch::Receiver<OrchestrationSettings>,
    control_tx: mpsc::Sender<Control>,
    request_tx: mpsc::Sender<Request>,
    ids: Arc<AtomicU64>,
}

struct Shared {
    cancel: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: stop the actor without waiting.
        self.cancel.cancel();
    }
}

/// Handle to the leader-activity coordinator of this node.
///
/// Cloneable; every clone talks to the same background actor. Dropping the
/// last clone cancels the actor without waiting; use
/// [`shutdown()`](Self::shutdown) to wait for supervised workers to be
/// torn down.
#[derive(Clone)]
pub struct Coordinator {
    core: CoordinatorCore,
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Spawn the coordinator actor for this node.
    ///
    /// `settings` is read at every call, so configuration changes (compat
    /// upgrades, the orchestration kill switch, timeout retuning) take
    /// effect without a restart.
    #[must_use]
    pub fn spawn(local_node: NodeId, settings: watch::Receiver<OrchestrationSettings>) -> Self {
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(64);
        let (request_tx, request_rx) = mpsc::channel(64);

        let actor =
            CoordinatorActor::new(local_node.clone(), control_rx, request_rx, cancel.clone());
        let actor_handle = tokio::spawn(actor.run());

        Self {
            core: CoordinatorCore {
                local_node,
                settings,
                control_tx,
                request_tx,
                ids: Arc::new(AtomicU64::new(1)),
            },
            shared: Arc::new(Shared {
                cancel,
                actor: Mutex::new(Some(actor_handle)),
            }),
        }
    }

    /// The node this coordinator runs on.
    #[must_use]
    pub fn local_node(&self) -> &NodeId {
        &self.core.local_node
    }

    /// Graceful shutdown: stops the actor and waits until every supervised
    /// worker has been cancelled and drained.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let handle = match self.shared.actor.lock() {
            Ok(mut actor) => actor.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Start an activity and wait for its result.
    ///
    /// Mints a fresh activity tree under the `leader` lease; callers
    /// already inside an activity must go through
    /// [`ActivityContext::run_activity`] so domain-token and lease fencing
    /// carry over. A `target` other than the local node is refused: bodies
    /// are anonymous closures and cannot be shipped across nodes.
    ///
    /// # Errors
    ///
    /// [`ActivityError::NoQuorum`] when admission times out,
    /// [`ActivityError::DomainConflict`] when another tree owns the
    /// domain, [`ActivityError::ActivityFailed`] when the activity was
    /// admitted and then terminated by precondition loss.
    pub async fn run_activity<F, T>(
        &self,
        target: Option<&NodeId>,
        domain: Option<Domain>,
        name: ActivityName,
        quorum: Quorum,
        options: ActivityOptions,
        body: impl FnOnce(ActivityContext) -> F,
    ) -> Result<T, Report<ActivityError>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if let Some(node) = target
            && *node != self.core.local_node
        {
            return Err(Report::new(ActivityError::NonLocalBody {
                target: node.clone(),
            }));
        }
        let token = ActivityToken::fresh(LeaseExpectation::Leader, domain.unwrap_or_default())
            .child(name, options);
        self.core
            .run_in_tree(LeaseExpectation::Leader, token, quorum, None, body)
            .await
    }

    /// Start an activity asynchronously; returns a monitored handle
    /// immediately after admission.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`run_activity`](Self::run_activity).
    pub async fn start_activity<F>(
        &self,
        domain: Option<Domain>,
        name: ActivityName,
        quorum: Quorum,
        options: ActivityOptions,
        body: impl FnOnce(ActivityContext) -> F,
    ) -> Result<ActivityHandle, Report<ActivityError>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = ActivityToken::fresh(LeaseExpectation::Leader, domain.unwrap_or_default())
            .child(name, options);
        self.core
            .start_in_tree(LeaseExpectation::Leader, token, quorum, None, body)
            .await
    }

    /// Adopt the calling worker as an activity.
    ///
    /// Admits under whatever local lease is currently held (there is no
    /// leadership requirement unless the quorum imposes one), which is how
    /// services on non-leader nodes register follower activities. The
    /// returned context must be used for any nested coordinator calls; the
    /// guard's drop is the worker's death.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`run_activity`](Self::run_activity).
    pub async fn register_process(
        &self,
        domain: Option<Domain>,
        name: ActivityName,
        quorum: Quorum,
        options: ActivityOptions,
    ) -> Result<RegisteredActivity, Report<ActivityError>> {
        let token = ActivityToken::fresh(LeaseExpectation::AnyLocal, domain.unwrap_or_default())
            .child(name, options);
        self.core
            .adopt_in_tree(LeaseExpectation::AnyLocal, token, quorum, None)
            .await
    }

    /// Register the calling worker as the lease agent.
    ///
    /// # Errors
    ///
    /// [`ActivityError::AlreadyRegistered`] while another agent is live.
    pub async fn register_agent(&self) -> Result<CollaboratorGuard, Report<ActivityError>> {
        self.register_collaborator(Role::Agent).await
    }

    /// Register the calling worker as the lease acquirer.
    ///
    /// # Errors
    ///
    /// [`ActivityError::AlreadyRegistered`] while another acquirer is live.
    pub async fn register_acquirer(&self) -> Result<CollaboratorGuard, Report<ActivityError>> {
        self.register_collaborator(Role::Acquirer).await
    }

    async fn register_collaborator(
        &self,
        role: Role,
    ) -> Result<CollaboratorGuard, Report<ActivityError>> {
        let (alive_tx, alive_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.core
            .control_tx
            .send(Control::RegisterCollaborator {
                role,
                monitor: alive_rx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))?;
        let id = reply_rx
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))??;
        Ok(CollaboratorGuard {
            id,
            _alive: alive_tx,
        })
    }

    /// Report a remote lease obtained by the acquirer.
    ///
    /// # Errors
    ///
    /// [`ActivityError::WrongProcess`] unless `from` is the registered
    /// acquirer.
    pub async fn lease_acquired(
        &self,
        from: CollaboratorId,
        node: NodeId,
    ) -> Result<(), Report<ActivityError>> {
        self.control_call(|reply| Control::LeaseAcquired { from, node, reply })
            .await
    }

    /// Report a remote lease lost by the acquirer. Activities whose quorum
    /// no longer holds are terminated.
    ///
    /// # Errors
    ///
    /// [`ActivityError::WrongProcess`] unless `from` is the registered
    /// acquirer.
    pub async fn lease_lost(
        &self,
        from: CollaboratorId,
        node: NodeId,
    ) -> Result<(), Report<ActivityError>> {
        self.control_call(|reply| Control::LeaseLost { from, node, reply })
            .await
    }

    /// Report a local lease granted to this node.
    ///
    /// # Errors
    ///
    /// [`ActivityError::WrongProcess`] unless `from` is the registered
    /// agent; [`ActivityError::InvalidLeaseTransition`] while a lease is
    /// already held (one grant per expiry cycle).
    pub async fn local_lease_granted(
        &self,
        from: CollaboratorId,
        holder: LeaseHolder,
    ) -> Result<(), Report<ActivityError>> {
        self.control_call(|reply| Control::LocalLeaseGranted {
            from,
            holder,
            reply,
        })
        .await
    }

    /// Report the local lease expired. All activities are terminated.
    ///
    /// # Errors
    ///
    /// [`ActivityError::WrongProcess`] unless `from` is the registered
    /// agent; [`ActivityError::InvalidLeaseTransition`] when `holder` is
    /// not the lease currently held.
    pub async fn local_lease_expired(
        &self,
        from: CollaboratorId,
        holder: LeaseHolder,
    ) -> Result<(), Report<ActivityError>> {
        self.control_call(|reply| Control::LocalLeaseExpired {
            from,
            holder,
            reply,
        })
        .await
    }

    async fn control_call(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), Report<ActivityError>>>) -> Control,
    ) -> Result<(), Report<ActivityError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.core
            .control_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))?;
        reply_rx
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))?
    }

    /// Replace the quorum-node set after a membership event. Every live
    /// activity is re-checked against the new set.
    ///
    /// # Errors
    ///
    /// [`ActivityError::Shutdown`] if the coordinator is gone.
    pub async fn membership_changed(
        &self,
        nodes: BTreeSet<NodeId>,
    ) -> Result<(), Report<ActivityError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.core
            .control_tx
            .send(Control::MembershipChanged {
                nodes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))?;
        reply_rx
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))
    }

    /// Snapshot the coordinator's current state.
    ///
    /// # Errors
    ///
    /// [`ActivityError::Shutdown`] if the coordinator is gone.
    pub async fn status(&self) -> Result<CoordinatorStatus, Report<ActivityError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.core
            .request_tx
            .send(Request::Status { reply: reply_tx })
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))?;
        reply_rx
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))
    }
}

impl CoordinatorCore {
    fn next_id(&self) -> ActivityId {
        ActivityId(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    async fn run_in_tree<F, T>(
        &self,
        lease: LeaseExpectation,
        token: ActivityToken,
        quorum: Quorum,
        parent: Option<&CancellationToken>,
        body: impl FnOnce(ActivityContext) -> F,
    ) -> Result<T, Report<ActivityError>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id();
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let reason = Arc::new(OnceLock::new());
        let ctx = ActivityContext {
            core: self.clone(),
            token: token.clone(),
            id,
            cancel: cancel.clone(),
            reason: Arc::clone(&reason),
        };

        let (value_tx, value_rx) = oneshot::channel();
        let fut = body(ctx);
        let task: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = value_tx.send(fut.await);
        });

        let exit_rx = self
            .admit_start(lease, token.clone(), quorum, id, cancel, reason, task)
            .await?;

        match value_rx.await {
            Ok(value) => Ok(value),
            // The worker never produced a value; its monitored exit says
            // why.
            Err(_) => match exit_rx.await {
                Ok(ActivityExit::Terminated(why)) => {
                    Err(Report::new(ActivityError::ActivityFailed {
                        domain: token.domain,
                        name: token.name,
                        reason: why,
                    }))
                }
                Ok(_) | Err(_) => Err(Report::new(ActivityError::WorkerLost {
                    domain: token.domain,
                    name: token.name,
                })),
            },
        }
    }

    async fn start_in_tree<F>(
        &self,
        lease: LeaseExpectation,
        token: ActivityToken,
        quorum: Quorum,
        parent: Option<&CancellationToken>,
        body: impl FnOnce(ActivityContext) -> F,
    ) -> Result<ActivityHandle, Report<ActivityError>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let reason = Arc::new(OnceLock::new());
        let ctx = ActivityContext {
            core: self.clone(),
            token: token.clone(),
            id,
            cancel: cancel.clone(),
            reason: Arc::clone(&reason),
        };

        let task: BoxFuture<'static, ()> = Box::pin(body(ctx));
        let exit = self
            .admit_start(lease, token, quorum, id, cancel, reason, task)
            .await?;
        Ok(ActivityHandle { id, exit })
    }

    #[allow(clippy::too_many_arguments)]
    async fn admit_start(
        &self,
        lease: LeaseExpectation,
        token: ActivityToken,
        quorum: Quorum,
        id: ActivityId,
        cancel: CancellationToken,
        reason: Arc<OnceLock<ShutdownReason>>,
        task: BoxFuture<'static, ()>,
    ) -> Result<oneshot::Receiver<ActivityExit>, Report<ActivityError>> {
        let settings = self.settings.borrow().clone();
        let (exit_tx, exit_rx) = oneshot::channel();

        if settings.bypass_active() {
            // Pre-upgrade behavior: run the body on a fresh worker with no
            // admission and no precondition supervision.
            let worker = supervised(cancel, task);
            tokio::spawn(async move {
                worker.await;
                let _ = exit_tx.send(ActivityExit::Completed);
            });
            return Ok(exit_rx);
        }

        let quorum_timeout = settings.quorum_timeout_for(&token.options);
        let total = settings.total_timeout_for(&token.options);
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AdmissionRequest {
            lease,
            quorum: quorum.normalize(),
            unsafe_admission: token.options.is_unsafe(),
            quorum_timeout,
            call: AdmissionCall::Start(StartActivity {
                worker: supervised(cancel.clone(), task),
                token,
                id,
                cancel,
                reason,
                exit: exit_tx,
                reply: reply_tx,
            }),
        };
        self.request_tx
            .send(Request::Admission(request))
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))?;

        let replied = tokio::time::timeout(total, reply_rx)
            .await
            .map_err(|_| Report::new(ActivityError::Timeout))?;
        replied.map_err(|_| Report::new(ActivityError::Shutdown))??;
        Ok(exit_rx)
    }

    async fn adopt_in_tree(
        &self,
        lease: LeaseExpectation,
        token: ActivityToken,
        quorum: Quorum,
        parent: Option<&CancellationToken>,
    ) -> Result<RegisteredActivity, Report<ActivityError>> {
        let settings = self.settings.borrow().clone();
        let id = self.next_id();
        let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let reason = Arc::new(OnceLock::new());
        let (alive_tx, alive_rx) = oneshot::channel();

        let token = if settings.bypass_active() {
            // No registration happens in bypass mode; hand back the token
            // and an inert guard.
            token
        } else {
            let quorum_timeout = settings.quorum_timeout_for(&token.options);
            let total = settings.total_timeout_for(&token.options);
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = AdmissionRequest {
                lease,
                quorum: quorum.normalize(),
                unsafe_admission: token.options.is_unsafe(),
                quorum_timeout,
                call: AdmissionCall::Adopt(AdoptProcess {
                    token,
                    id,
                    monitor: alive_rx,
                    cancel: cancel.clone(),
                    reason: Arc::clone(&reason),
                    reply: reply_tx,
                }),
            };
            self.request_tx
                .send(Request::Admission(request))
                .await
                .map_err(|_| Report::new(ActivityError::Shutdown))?;

            let replied = tokio::time::timeout(total, reply_rx)
                .await
                .map_err(|_| Report::new(ActivityError::Timeout))?;
            replied.map_err(|_| Report::new(ActivityError::Shutdown))??
        };

        let context = ActivityContext {
            core: self.clone(),
            token,
            id,
            cancel: cancel.clone(),
            reason: Arc::clone(&reason),
        };
        Ok(RegisteredActivity {
            context,
            guard: ActivityGuard {
                _alive: alive_tx,
                cancel,
                reason,
            },
        })
    }
}

/// Wrap an activity body so that cancelling the token preempts it.
fn supervised(cancel: CancellationToken, body: BoxFuture<'static, ()>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            () = body => {}
        }
    })
}

/// Execution context of a live activity.
///
/// Handed to the body as a parameter (never ambient state); nested
/// coordinator calls go through it so domain-token, lease fencing, option
/// inheritance, and parent-child cancellation all carry over.
#[derive(Clone, Debug)]
pub struct ActivityContext {
    core: CoordinatorCore,
    token: ActivityToken,
    id: ActivityId,
    cancel: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ActivityContext {
    #[must_use]
    pub fn token(&self) -> &ActivityToken {
        &self.token
    }

    #[must_use]
    pub fn id(&self) -> ActivityId {
        self.id
    }

    /// Completes when this activity is cancelled, either by parent
    /// teardown or by forced termination.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The reason the coordinator recorded when force-terminating this
    /// activity, if it has.
    #[must_use]
    pub fn termination_reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    fn child_token(
        &self,
        domain: Option<Domain>,
        name: ActivityName,
        options: ActivityOptions,
    ) -> Result<ActivityToken, Report<ActivityError>> {
        if let Some(requested) = domain
            && requested != self.token.domain
        {
            return Err(Report::new(ActivityError::DomainMismatch {
                requested,
                token: self.token.domain.clone(),
            }));
        }
        Ok(self.token.child(name, options))
    }

    /// Start a nested activity and wait for its result. The child is
    /// admitted under the parent's lease and torn down with the parent.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`Coordinator::run_activity`], plus
    /// [`ActivityError::DomainMismatch`] if `domain` names a different
    /// domain than the parent.
    pub async fn run_activity<F, T>(
        &self,
        domain: Option<Domain>,
        name: ActivityName,
        quorum: Quorum,
        options: ActivityOptions,
        body: impl FnOnce(ActivityContext) -> F,
    ) -> Result<T, Report<ActivityError>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.child_token(domain, name, options)?;
        self.core
            .run_in_tree(token.lease.clone(), token, quorum, Some(&self.cancel), body)
            .await
    }

    /// Start a nested activity asynchronously.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`run_activity`](Self::run_activity).
    pub async fn start_activity<F>(
        &self,
        domain: Option<Domain>,
        name: ActivityName,
        quorum: Quorum,
        options: ActivityOptions,
        body: impl FnOnce(ActivityContext) -> F,
    ) -> Result<ActivityHandle, Report<ActivityError>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.child_token(domain, name, options)?;
        self.core
            .start_in_tree(token.lease.clone(), token, quorum, Some(&self.cancel), body)
            .await
    }

    /// Adopt an externally created worker as a nested activity.
    ///
    /// # Errors
    ///
    /// Same admission errors as [`run_activity`](Self::run_activity).
    pub async fn register_process(
        &self,
        domain: Option<Domain>,
        name: ActivityName,
        quorum: Quorum,
        options: ActivityOptions,
    ) -> Result<RegisteredActivity, Report<ActivityError>> {
        let token = self.child_token(domain, name, options)?;
        self.core
            .adopt_in_tree(token.lease.clone(), token, quorum, Some(&self.cancel))
            .await
    }

    /// Change this activity's quorum. The switch is itself an admission
    /// wait: it only takes effect once the new quorum holds.
    ///
    /// # Errors
    ///
    /// [`ActivityError::NoQuorum`] when the new quorum cannot be
    /// satisfied within the quorum timeout.
    pub async fn switch_quorum(
        &self,
        quorum: Quorum,
        options: ActivityOptions,
    ) -> Result<(), Report<ActivityError>> {
        let settings = self.core.settings.borrow().clone();
        if settings.bypass_active() {
            return Ok(());
        }

        let options = options.inherit(&self.token.options);
        let normalized = quorum.normalize();
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AdmissionRequest {
            lease: self.token.lease.clone(),
            quorum: normalized.clone(),
            unsafe_admission: options.is_unsafe(),
            quorum_timeout: settings.quorum_timeout_for(&options),
            call: AdmissionCall::Switch {
                id: self.id,
                quorum: normalized,
                reply: reply_tx,
            },
        };
        self.core
            .request_tx
            .send(Request::Admission(request))
            .await
            .map_err(|_| Report::new(ActivityError::Shutdown))?;

        let replied = tokio::time::timeout(settings.total_timeout_for(&options), reply_rx)
            .await
            .map_err(|_| Report::new(ActivityError::Timeout))?;
        replied.map_err(|_| Report::new(ActivityError::Shutdown))?
    }
}

/// Handle to an activity started with [`Coordinator::start_activity`].
#[derive(Debug)]
pub struct ActivityHandle {
    id: ActivityId,
    exit: oneshot::Receiver<ActivityExit>,
}

impl ActivityHandle {
    #[must_use]
    pub fn id(&self) -> ActivityId {
        self.id
    }

    /// Wait for the worker's monitored exit.
    pub async fn join(self) -> ActivityExit {
        self.exit.await.unwrap_or(ActivityExit::Failed)
    }
}

/// A worker adopted via `register_process`: the context to thread through
/// nested calls plus the registration guard.
#[derive(Debug)]
pub struct RegisteredActivity {
    pub context: ActivityContext,
    pub guard: ActivityGuard,
}

/// RAII registration of an adopted worker. Dropping the guard is the
/// worker's death as far as the coordinator is concerned.
#[derive(Debug)]
pub struct ActivityGuard {
    _alive: oneshot::Sender<()>,
    cancel: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ActivityGuard {
    /// Completes when the coordinator force-terminates this activity; the
    /// worker should unwind and drop the guard.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The recorded termination reason, once force-terminated.
    #[must_use]
    pub fn termination_reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }
}

/// RAII registration of a collaborator. Dropping the guard is the
/// collaborator's death: its slot is cleared and the corresponding
/// cleanup (lease forfeiture, activity termination) runs.
#[derive(Debug)]
pub struct CollaboratorGuard {
    id: CollaboratorId,
    _alive: oneshot::Sender<()>,
}

impl CollaboratorGuard {
    #[must_use]
    pub fn id(&self) -> CollaboratorId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_types_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Coordinator>();
        assert_send::<ActivityContext>();
        assert_send::<ActivityHandle>();
        assert_send::<CollaboratorGuard>();
        assert_send::<RegisteredActivity>();
    }
}
