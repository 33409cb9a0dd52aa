//! Test utilities for warden integration tests.

use std::collections::BTreeSet;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};
use warden_coordinator::{CollaboratorGuard, Coordinator, OrchestrationSettings};
use warden_core::{ActivityName, Domain, EpochToken, LeaseHolder, NodeId};

/// Initialize tracing for tests. Safe to call multiple times; uses the
/// `RUST_LOG` env var for filtering.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warden_coordinator=debug")),
        )
        .with_test_writer()
        .try_init();
}

#[must_use]
pub fn node(name: &str) -> NodeId {
    NodeId::from(name)
}

#[must_use]
pub fn nodes(names: &[&str]) -> BTreeSet<NodeId> {
    names.iter().map(|name| NodeId::from(*name)).collect()
}

#[must_use]
pub fn name(value: &str) -> ActivityName {
    ActivityName::from(value)
}

#[must_use]
pub fn domain(value: &str) -> Domain {
    Domain::from(value)
}

#[must_use]
pub fn lease(holder: &NodeId, epoch: &[u8]) -> LeaseHolder {
    LeaseHolder::new(holder.clone(), EpochToken::new(epoch.to_vec()))
}

/// A coordinator wired with a registered agent and acquirer and an
/// initial membership, ready for lease events.
pub struct TestCluster {
    pub coordinator: Coordinator,
    pub agent: CollaboratorGuard,
    pub acquirer: CollaboratorGuard,
    pub settings: watch::Sender<OrchestrationSettings>,
    pub local: NodeId,
}

impl TestCluster {
    /// Coordinator on `n1` with the standard `{n1, n2, n3}` membership.
    pub async fn start() -> Self {
        Self::start_on("n1", &["n1", "n2", "n3"]).await
    }

    pub async fn start_on(local: &str, members: &[&str]) -> Self {
        init_tracing();
        let (settings_tx, settings_rx) = watch::channel(OrchestrationSettings::default());
        let local = node(local);
        let coordinator = Coordinator::spawn(local.clone(), settings_rx);
        let agent = coordinator.register_agent().await.expect("register agent");
        let acquirer = coordinator
            .register_acquirer()
            .await
            .expect("register acquirer");
        coordinator
            .membership_changed(nodes(members))
            .await
            .expect("set membership");
        Self {
            coordinator,
            agent,
            acquirer,
            settings: settings_tx,
            local,
        }
    }

    pub async fn grant_local_lease(&self, holder: LeaseHolder) {
        self.coordinator
            .local_lease_granted(self.agent.id(), holder)
            .await
            .expect("grant local lease");
    }

    pub async fn expire_local_lease(&self, holder: LeaseHolder) {
        self.coordinator
            .local_lease_expired(self.agent.id(), holder)
            .await
            .expect("expire local lease");
    }

    pub async fn acquire(&self, remote: &str) {
        self.coordinator
            .lease_acquired(self.acquirer.id(), node(remote))
            .await
            .expect("acquire remote lease");
    }

    pub async fn lose(&self, remote: &str) {
        self.coordinator
            .lease_lost(self.acquirer.id(), node(remote))
            .await
            .expect("lose remote lease");
    }

    /// Self-granted leader lease plus remote leases held on `held`: the
    /// usual happy-path setup.
    pub async fn become_leader(&self, held: &[&str]) -> LeaseHolder {
        let holder = lease(&self.local, b"epoch-1");
        self.grant_local_lease(holder.clone()).await;
        for remote in held {
            self.acquire(remote).await;
        }
        holder
    }
}
