//! Raft node implementation
//! This module contains the node actor: one tokio task per member owning the
//! consensus state, the log store and the state machine. Inbound messages,
//! administrative commands and timer ticks are all serialized through its
//! event loop.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use rand::Rng;
use serde_derive::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

use crate::config::RaftConfig;
use crate::metrics;
use crate::raft::codec::{ForwardProposal, Rpc};
use crate::raft::entry::{EntryKind, LogEntry, Snapshot};
use crate::raft::error::{RaftError, Result};
use crate::raft::proposal::{PendingProposals, Proposal};
use crate::raft::storage::{HardState, LogStore};
use crate::raft::transport::Transport;
use crate::raft::{PeerId, StateMachine};

// Constants
const TICK_INTERVAL: Duration = Duration::from_millis(10); // Interval for timer checks
const COMMIT_PERSIST_INTERVAL: Duration = Duration::from_secs(1); // Interval for saving the commit hint

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoleKind {
    Follower,
    Candidate,
    Leader,
}

/// Externally visible state of a node, published after every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: PeerId,
    pub role: RoleKind,
    pub term: u64,
    pub pterm: u64,
    pub pindex: u64,
    pub commit: u64,
    pub applied: u64,
    pub leader: Option<PeerId>,
    /// Set once the node stopped participating because of a fatal error.
    pub halted: Option<String>,
    pub stopped: bool,
}

/// Leader's view of one follower.
#[derive(Debug)]
pub(super) struct Progress {
    /// Next index to send.
    pub next: u64,
    /// Highest index known to be stored on the follower.
    pub matched: u64,
    pub last_contact: Instant,
}

pub(super) enum Role {
    Follower,
    Candidate {
        votes: HashSet<PeerId>,
    },
    Leader {
        progress: HashMap<PeerId, Progress>,
        next_heartbeat: Instant,
        since: Instant,
    },
}

impl Role {
    fn kind(&self) -> RoleKind {
        match self {
            Role::Follower => RoleKind::Follower,
            Role::Candidate { .. } => RoleKind::Candidate,
            Role::Leader { .. } => RoleKind::Leader,
        }
    }
}

enum Command {
    Propose(Proposal),
    Forward(Vec<u8>, oneshot::Sender<Result<()>>),
    StepDown(oneshot::Sender<Result<()>>),
    Snapshot(oneshot::Sender<Result<u64>>),
    Stop(oneshot::Sender<()>),
}

/// Raft node implementation
/// Owns the consensus state of one member. Only reachable through a [`NodeHandle`].
pub struct RaftNode<S: StateMachine> {
    pub(super) id: PeerId,
    pub(super) peers: Vec<PeerId>,
    pub(super) config: RaftConfig,
    pub(super) store: LogStore,
    pub(super) state_machine: S,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) term: u64,
    pub(super) voted_for: Option<PeerId>,
    pub(super) commit: u64,
    pub(super) applied: u64,
    pub(super) role: Role,
    pub(super) leader: Option<PeerId>,
    pub(super) election_deadline: Instant,
    pub(super) pending: PendingProposals,
    halted: Option<String>,
    last_commit_persist: Instant,
    status_tx: watch::Sender<NodeStatus>,
}

impl<S: StateMachine> RaftNode<S> {
    /// Start a raft node
    /// Opens (or recovers) the log in `dir`, restores the latest snapshot into
    /// `state_machine`, replays committed entries and spawns the event loop.
    /// `members` lists the whole group, this node included.
    pub fn start(
        id: PeerId,
        members: &[PeerId],
        config: RaftConfig,
        dir: impl Into<PathBuf>,
        mut state_machine: S,
        transport: Arc<dyn Transport>,
        inbox: UnboundedReceiver<Vec<u8>>,
    ) -> Result<NodeHandle> {
        config.validate()?;
        let store = LogStore::open(dir.into(), config.sync_writes, config.segment_entries)?;

        let snapshot = store.snapshot();
        if snapshot.last_index > Snapshot::initial().last_index {
            info!(
                "[{}] restoring snapshot at {}/{}",
                id, snapshot.last_index, snapshot.last_term
            );
            state_machine.restore(&snapshot.data)?;
        }

        let hard_state = store.hard_state().clone();
        let boundary = snapshot.last_index;
        let commit = hard_state.commit.min(store.last_index()).max(boundary);
        let peers: Vec<PeerId> = members.iter().filter(|m| **m != id).cloned().collect();
        let proposal_timeout = config.proposal_timeout();

        let now = Instant::now();
        let initial = NodeStatus {
            id: id.clone(),
            role: RoleKind::Follower,
            term: hard_state.term,
            pterm: store.last_term(),
            pindex: store.last_index(),
            commit,
            applied: boundary,
            leader: None,
            halted: None,
            stopped: false,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let mut node = RaftNode {
            id: id.clone(),
            peers,
            config,
            store,
            state_machine,
            transport,
            term: hard_state.term,
            voted_for: hard_state.voted_for,
            commit,
            applied: boundary,
            role: Role::Follower,
            leader: None,
            election_deadline: now,
            pending: PendingProposals::default(),
            halted: None,
            last_commit_persist: now,
            status_tx,
        };
        node.reset_election_deadline();
        // Replay what was committed before the restart.
        node.apply_committed()?;
        info!(
            "[{}] started: term {}, pindex {}, commit {}, applied {}",
            node.id,
            node.term,
            node.store.last_index(),
            node.commit,
            node.applied
        );
        node.publish_status();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(node.run(inbox, command_rx));

        Ok(NodeHandle {
            id,
            commands,
            status: status_rx,
            proposal_timeout,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    /// Main event loop that handles messages, commands, and periodic tasks
    async fn run(
        mut self,
        mut inbox: UnboundedReceiver<Vec<u8>>,
        mut commands: UnboundedReceiver<Command>,
    ) {
        let mut ticker = time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(bytes) = inbox.recv() => {
                    self.handle_bytes(bytes);
                    while let Ok(bytes) = inbox.try_recv() {
                        self.handle_bytes(bytes);
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Stop(ack)) => {
                        self.shutdown();
                        let _ = ack.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                _ = ticker.tick() => self.tick(),
            }

            self.check_invariants();
            self.publish_status();
        }
    }

    fn handle_bytes(&mut self, bytes: Vec<u8>) {
        if self.halted.is_some() {
            return;
        }
        let rpc = match Rpc::decode(&bytes) {
            Ok(rpc) => rpc,
            Err(e) => {
                metrics::MALFORMED
                    .with_label_values(&[self.id.as_str()])
                    .inc();
                debug!("[{}] dropping {} byte message: {}", self.id, bytes.len(), e);
                return;
            }
        };
        let kind = rpc.kind();
        if let Err(e) = self.handle_rpc(rpc) {
            self.halt(format!("handling {}: {}", kind, e));
        }
    }

    fn handle_rpc(&mut self, rpc: Rpc) -> Result<()> {
        match rpc {
            Rpc::AppendEntry(ae) => self.handle_append_entry(ae),
            Rpc::AppendEntryResponse(resp) => self.handle_append_entry_response(resp),
            Rpc::VoteRequest(req) => self.handle_vote_request(req),
            Rpc::VoteResponse(resp) => self.handle_vote_response(resp),
            Rpc::TimeoutNow(t) => self.handle_timeout_now(t),
            Rpc::InstallSnapshot(s) => self.handle_install_snapshot(s),
            Rpc::ForwardProposal(p) => self.handle_forward_proposal(p),
        }
    }

    fn handle_command(&mut self, command: Command) {
        if let Some(reason) = &self.halted {
            let err = || RaftError::Halted(reason.clone());
            match command {
                Command::Propose(p) => p.complete(Err(err())),
                Command::Forward(_, ack) => {
                    let _ = ack.send(Err(err()));
                }
                Command::StepDown(ack) => {
                    let _ = ack.send(Err(err()));
                }
                Command::Snapshot(ack) => {
                    let _ = ack.send(Err(err()));
                }
                Command::Stop(ack) => {
                    let _ = ack.send(());
                }
            }
            return;
        }

        match command {
            Command::Propose(proposal) => {
                if let Err(e) = self.propose(proposal) {
                    self.halt(format!("proposing: {}", e));
                }
            }
            Command::Forward(data, ack) => {
                let result = self.forward(data);
                let _ = ack.send(result);
            }
            Command::StepDown(ack) => {
                let _ = ack.send(self.step_down());
            }
            Command::Snapshot(ack) => {
                let result = self.take_snapshot();
                if let Err(e) = &result {
                    warn!("[{}] snapshot failed: {}", self.id, e);
                }
                let _ = ack.send(result);
            }
            Command::Stop(ack) => {
                let _ = ack.send(());
            }
        }
    }

    /// Appends a client proposal at the current term. Leader only.
    pub(super) fn propose(&mut self, mut proposal: Proposal) -> Result<()> {
        if !self.is_leader() {
            proposal.complete(Err(RaftError::NotLeader {
                leader: self.leader.clone(),
            }));
            return Ok(());
        }

        let index = self.store.last_index() + 1;
        let data = std::mem::take(&mut proposal.data);
        let entry = LogEntry::normal(self.term, index, data);
        if let Err(e) = self.store.append(entry) {
            proposal.complete(Err(RaftError::Halted(e.to_string())));
            return Err(e.into());
        }
        proposal.term = self.term;
        proposal.index = index;
        self.pending.push(proposal);
        metrics::PROPOSALS
            .with_label_values(&[self.id.as_str()])
            .inc();

        self.replicate_all()?;
        self.maybe_advance_commit()
    }

    fn forward(&mut self, data: Vec<u8>) -> Result<()> {
        if self.is_leader() {
            let (proposal, _rx) = Proposal::normal(data);
            return self.propose(proposal);
        }
        match self.leader.clone() {
            Some(leader) => {
                self.send(
                    &leader,
                    Rpc::ForwardProposal(ForwardProposal {
                        from: self.id.clone(),
                        data,
                    }),
                );
                Ok(())
            }
            None => Err(RaftError::NotLeader { leader: None }),
        }
    }

    fn tick(&mut self) {
        if self.halted.is_some() {
            return;
        }
        if let Err(e) = self.tick_inner() {
            self.halt(format!("timer: {}", e));
        }
    }

    fn tick_inner(&mut self) -> Result<()> {
        let now = Instant::now();
        match self.role {
            Role::Leader { .. } => self.leader_tick(now)?,
            _ => {
                if now >= self.election_deadline {
                    self.election_timeout()?;
                }
            }
        }

        let threshold = self.config.snapshot_threshold;
        if threshold > 0 && self.applied >= self.store.snapshot().last_index + threshold {
            if let Err(e) = self.take_snapshot() {
                warn!("[{}] automatic snapshot failed: {}", self.id, e);
            }
        }

        if self.commit != self.store.hard_state().commit
            && now.duration_since(self.last_commit_persist) >= COMMIT_PERSIST_INTERVAL
        {
            self.persist_hard_state()?;
            self.last_commit_persist = now;
        }
        Ok(())
    }

    /// Applies every entry in `(applied, commit]` in order.
    pub(super) fn apply_committed(&mut self) -> Result<()> {
        while self.applied < self.commit {
            let index = self.applied + 1;
            let entry = self.store.get(index)?;
            match entry.kind {
                EntryKind::Normal => self.state_machine.apply(index, &entry.data)?,
                EntryKind::LeaderChange => {
                    debug!("[{}] leader change marker at {} committed", self.id, index)
                }
            }
            self.applied = index;
            metrics::APPLIED.with_label_values(&[self.id.as_str()]).inc();
        }

        let store = &self.store;
        self.pending
            .notice_applied(self.applied, |index| store.term(index).ok());
        Ok(())
    }

    /// Snapshots the state machine at `applied` and compacts the log up to it.
    pub(super) fn take_snapshot(&mut self) -> Result<u64> {
        let boundary = self.store.snapshot().last_index;
        if self.applied <= boundary {
            return Ok(boundary);
        }

        let data = self.state_machine.snapshot()?;
        let snapshot = Snapshot {
            last_index: self.applied,
            last_term: self.store.term(self.applied)?,
            data,
        };
        self.store.compact_before(self.applied, snapshot)?;
        self.persist_hard_state()?;
        metrics::SNAPSHOTS
            .with_label_values(&[self.id.as_str(), "taken"])
            .inc();
        info!("[{}] snapshot taken at index {}", self.id, self.applied);
        Ok(self.applied)
    }

    pub(super) fn persist_hard_state(&mut self) -> Result<()> {
        self.store.save_hard_state(HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
            commit: self.commit,
        })?;
        Ok(())
    }

    pub(super) fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// Votes (or acknowledgements) needed, counting this node.
    pub(super) fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub(super) fn reset_election_deadline(&mut self) {
        let min = self.config.election_timeout_min_ms;
        let max = self.config.election_timeout_max_ms;
        let timeout = rand::thread_rng().gen_range(min..max);
        self.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    pub(super) fn send(&self, to: &PeerId, rpc: Rpc) {
        match rpc.encode() {
            Ok(bytes) => self.transport.send(&self.id, to, bytes),
            Err(e) => error!("[{}] failed to encode {}: {}", self.id, rpc.kind(), e),
        }
    }

    pub(super) fn broadcast(&self, rpc: &Rpc) {
        match rpc.encode() {
            Ok(bytes) => {
                for peer in &self.peers {
                    self.transport.send(&self.id, peer, bytes.clone());
                }
            }
            Err(e) => error!("[{}] failed to encode {}: {}", self.id, rpc.kind(), e),
        }
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            role: self.role.kind(),
            term: self.term,
            pterm: self.store.last_term(),
            pindex: self.store.last_index(),
            commit: self.commit,
            applied: self.applied,
            leader: self.leader.clone(),
            halted: self.halted.clone(),
            stopped: false,
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    fn check_invariants(&mut self) {
        if self.halted.is_some() {
            return;
        }
        let pindex = self.store.last_index();
        if self.applied > self.commit || self.commit > pindex {
            self.halt(format!(
                "invariant violated: applied {} commit {} pindex {}",
                self.applied, self.commit, pindex
            ));
            return;
        }
        let published = self.status_tx.borrow().commit;
        if self.commit < published {
            self.halt(format!(
                "commit went backwards from {} to {}",
                published, self.commit
            ));
        }
    }

    /// Stops consensus participation for good. Used when state may have diverged.
    pub(super) fn halt(&mut self, reason: String) {
        error!("[{}] halting consensus participation: {}", self.id, reason);
        let failed = reason.clone();
        self.pending.fail_all(|| RaftError::Halted(failed.clone()));
        self.role = Role::Follower;
        self.leader = None;
        self.halted = Some(reason);
    }

    fn shutdown(&mut self) {
        if self.halted.is_none() {
            if let Err(e) = self.persist_hard_state() {
                warn!("[{}] failed to persist state on stop: {}", self.id, e);
            }
        }
        self.pending.fail_all(|| RaftError::Stopped);
        self.role = Role::Follower;
        self.leader = None;

        let mut status = self.status();
        status.stopped = true;
        self.status_tx.send_replace(status);
        info!(
            "[{}] stopped at term {}, applied {}",
            self.id, self.term, self.applied
        );
    }
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: PeerId,
    commands: UnboundedSender<Command>,
    status: watch::Receiver<NodeStatus>,
    proposal_timeout: Duration,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl NodeHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Latest published status.
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.status.borrow().leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == RoleKind::Leader
    }

    /// Proposes `data` and waits until it is applied on this node.
    ///
    /// Fails immediately with [`RaftError::NotLeader`] on followers so the
    /// caller can redirect to the returned leader.
    pub async fn propose(&self, data: Vec<u8>) -> Result<u64> {
        let peer = self.id.to_string();
        metrics::record_propose(&peer, move || async move {
            let (proposal, rx) = Proposal::normal(data);
            self.commands
                .send(Command::Propose(proposal))
                .map_err(|_| RaftError::Stopped)?;
            match time::timeout(self.proposal_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RaftError::Stopped),
                Err(_) => Err(RaftError::Timeout),
            }
        })
        .await
    }

    /// Hands `data` to the current leader without waiting for it to commit.
    pub async fn forward_proposal(&self, data: Vec<u8>) -> Result<()> {
        self.request(|ack| Command::Forward(data, ack)).await?
    }

    /// Gives up leadership and asks the most caught-up follower to take over.
    pub async fn step_down(&self) -> Result<()> {
        self.request(Command::StepDown).await?
    }

    /// Snapshots the state machine and compacts the log. Returns the snapshot index.
    pub async fn snapshot(&self) -> Result<u64> {
        self.request(Command::Snapshot).await?
    }

    /// Stops the node and waits for its task to finish. Durable state stays on disk.
    pub async fn stop(&self) {
        let _ = self.request(Command::Stop).await;
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("[{}] node task failed: {}", self.id, e);
            }
        }
    }

    /// Waits until the published status satisfies `f`.
    pub async fn wait_for<F>(&self, timeout: Duration, mut f: F) -> Result<NodeStatus>
    where
        F: FnMut(&NodeStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let waited = time::timeout(timeout, async {
            rx.wait_for(&mut f).await.map(|status| status.clone())
        })
        .await;
        match waited {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => {
                let status = rx.borrow().clone();
                if f(&status) {
                    Ok(status)
                } else {
                    Err(RaftError::Stopped)
                }
            }
            Err(_) => Err(RaftError::Timeout),
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)
    }
}
