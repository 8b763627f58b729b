//! In-process raft group
//!
//! Orchestrates a set of nodes wired through a [`LocalRouter`]: creation,
//! leader discovery, proposals, step-down, snapshots, stop and restart from
//! disk. It only ever holds node handles, never node internals.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use rand::seq::IteratorRandom;
use tokio::time::{self, Duration, Instant};

use crate::config::RaftConfig;
use crate::raft::transport::LocalRouter;
use crate::raft::{NodeHandle, NodeStatus, PeerId, RaftError, RaftNode, RoleKind, StateMachine};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Factory<S> = Box<dyn Fn(&PeerId) -> S + Send + Sync>;

pub struct RaftGroup<S: StateMachine + Clone> {
    name: String,
    root: PathBuf,
    config: RaftConfig,
    router: LocalRouter,
    members: Vec<PeerId>,
    factory: Factory<S>,
    running: BTreeMap<PeerId, NodeHandle>,
    // Clone of each member's state machine, as last started.
    states: BTreeMap<PeerId, S>,
}

impl<S: StateMachine + Clone> RaftGroup<S> {
    /// Creates and starts `size` members storing their logs under `root/name`.
    /// `factory` builds a fresh state machine each time a member starts.
    pub fn create<F>(
        name: &str,
        size: usize,
        root: impl AsRef<Path>,
        config: RaftConfig,
        factory: F,
    ) -> Result<Self, RaftError>
    where
        F: Fn(&PeerId) -> S + Send + Sync + 'static,
    {
        if size == 0 {
            return Err(RaftError::Config("a group needs at least one member".into()));
        }
        let mut ids = HashSet::new();
        while ids.len() < size {
            ids.insert(PeerId::random());
        }

        let mut group = RaftGroup {
            name: name.to_string(),
            root: root.as_ref().join(name),
            config,
            router: LocalRouter::new(),
            members: ids.into_iter().collect(),
            factory: Box::new(factory),
            running: BTreeMap::new(),
            states: BTreeMap::new(),
        };
        group.members.sort();
        for id in group.members.clone() {
            group.start_member(&id)?;
        }
        info!("group {} created with {} members", group.name, size);
        Ok(group)
    }

    fn start_member(&mut self, id: &PeerId) -> Result<NodeHandle, RaftError> {
        let state = (self.factory)(id);
        let inbox = self.router.register(id);
        let handle = RaftNode::start(
            id.clone(),
            &self.members,
            self.config.clone(),
            self.root.join(id.as_str()),
            state.clone(),
            Arc::new(self.router.clone()),
            inbox,
        );
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.router.unregister(id);
                return Err(e);
            }
        };
        self.states.insert(id.clone(), state);
        self.running.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    pub fn router(&self) -> &LocalRouter {
        &self.router
    }

    pub fn node(&self, id: &PeerId) -> Option<&NodeHandle> {
        self.running.get(id)
    }

    /// Handles of every running member.
    pub fn running(&self) -> impl Iterator<Item = &NodeHandle> {
        self.running.values()
    }

    /// The state machine most recently started for `id`.
    pub fn state(&self, id: &PeerId) -> Option<&S> {
        self.states.get(id)
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.running.values().map(|n| n.status()).collect()
    }

    /// Running member currently acting as leader in the highest term.
    pub fn leader(&self) -> Option<NodeHandle> {
        self.running
            .values()
            .filter(|n| n.status().role == RoleKind::Leader)
            .max_by_key(|n| n.status().term)
            .cloned()
    }

    pub fn non_leader(&self) -> Option<NodeHandle> {
        self.running.values().find(|n| !n.is_leader()).cloned()
    }

    pub fn random_member(&self) -> Option<NodeHandle> {
        self.running
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    pub async fn wait_on_leader(&self, timeout: Duration) -> Result<NodeHandle, RaftError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(RaftError::Timeout);
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Polls the running members until `f` holds for their statuses.
    pub async fn wait_until<F>(&self, timeout: Duration, f: F) -> Result<Vec<NodeStatus>, RaftError>
    where
        F: Fn(&[NodeStatus]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let statuses = self.statuses();
            if f(&statuses) {
                return Ok(statuses);
            }
            if Instant::now() >= deadline {
                debug!("group {} gave up waiting: {:?}", self.name, statuses);
                return Err(RaftError::Timeout);
            }
            time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Proposes through the current leader, following redirects until applied.
    pub async fn propose(&self, data: Vec<u8>) -> Result<u64, RaftError> {
        let deadline = Instant::now() + self.config.proposal_timeout();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let leader = self.wait_on_leader(remaining).await?;
            match leader.propose(data.clone()).await {
                Err(RaftError::NotLeader { .. }) | Err(RaftError::ProposalDropped)
                    if Instant::now() < deadline =>
                {
                    time::sleep(POLL_INTERVAL).await;
                }
                result => return result,
            }
        }
    }

    pub async fn step_down(&self) -> Result<PeerId, RaftError> {
        let leader = self.leader().ok_or(RaftError::NotLeader { leader: None })?;
        leader.step_down().await?;
        Ok(leader.id().clone())
    }

    /// Stops `id`, keeping its data directory for a later restart.
    pub async fn stop(&mut self, id: &PeerId) {
        if let Some(handle) = self.running.remove(id) {
            handle.stop().await;
        }
        self.router.unregister(id);
        info!("group {}: stopped {}", self.name, id);
    }

    /// Restarts a stopped member from its data directory.
    pub fn restart(&mut self, id: &PeerId) -> Result<NodeHandle, RaftError> {
        if let Some(handle) = self.running.get(id) {
            return Ok(handle.clone());
        }
        info!("group {}: restarting {}", self.name, id);
        self.start_member(id)
    }

    pub async fn shutdown(&mut self) {
        let ids: Vec<PeerId> = self.running.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}
