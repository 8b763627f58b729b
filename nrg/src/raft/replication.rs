//! Log replication: the leader's per-follower cursors and the follower's
//! handling of append-entry and install-snapshot messages.

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::metrics;
use crate::raft::codec::{
    AppendEntry, AppendEntryResponse, ForwardProposal, InstallSnapshot, Rpc,
};
use crate::raft::entry::{Entry, Snapshot};
use crate::raft::error::{LogError, RaftError, Result};
use crate::raft::node::{RaftNode, Role};
use crate::raft::proposal::Proposal;
use crate::raft::{PeerId, StateMachine};

impl<S: StateMachine> RaftNode<S> {
    /// Heartbeat, replication re-drive and quorum check.
    pub(super) fn leader_tick(&mut self, now: Instant) -> Result<()> {
        let quorum = self.quorum();
        let max = self.config.election_timeout_max();
        let heartbeat = self.config.heartbeat_interval();

        let (due, lost_quorum) = match &mut self.role {
            Role::Leader {
                progress,
                next_heartbeat,
                since,
            } => {
                let reachable = 1 + progress
                    .values()
                    .filter(|p| now.duration_since(p.last_contact) < max)
                    .count();
                let lost = reachable < quorum && now.duration_since(*since) >= max;
                let due = now >= *next_heartbeat;
                // A lost message shows up as a heartbeat rejected at the cursor,
                // which retreats it, so heartbeats never rewind cursors themselves.
                if due {
                    *next_heartbeat = now + heartbeat;
                }
                (due, lost)
            }
            _ => return Ok(()),
        };

        if lost_quorum {
            warn!(
                "[{}] lost contact with a majority, stepping down from term {}",
                self.id, self.term
            );
            return self.become_follower(self.term, None);
        }
        if due {
            self.replicate_all()?;
        }
        Ok(())
    }

    pub(super) fn replicate_all(&mut self) -> Result<()> {
        let peers = self.peers.clone();
        for peer in &peers {
            self.send_append(peer)?;
        }
        Ok(())
    }

    fn set_next(&mut self, peer: &PeerId, next: u64) {
        if let Role::Leader { progress, .. } = &mut self.role {
            if let Some(p) = progress.get_mut(peer) {
                p.next = next;
            }
        }
    }

    /// Sends `peer` everything from its cursor on, or a heartbeat when it is caught up.
    fn send_append(&mut self, peer: &PeerId) -> Result<()> {
        let next = match &self.role {
            Role::Leader { progress, .. } => match progress.get(peer) {
                Some(p) => p.next,
                None => return Ok(()),
            },
            _ => return Ok(()),
        };
        let next = next.min(self.store.last_index() + 1);
        let pindex = next - 1;

        let pterm = match self.store.term(pindex) {
            Ok(term) => term,
            Err(LogError::Compacted(_)) => return self.send_snapshot(peer),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<Entry> = self
            .store
            .entries_from(next, self.config.max_append_entries)?
            .into_iter()
            .map(|e| Entry::new(e.term, e.kind, e.data))
            .collect();
        let sent = entries.len() as u64;

        let ae = AppendEntry {
            leader: self.id.to_string(),
            term: self.term,
            commit: self.commit,
            pterm,
            pindex,
            entries,
        };
        self.send(peer, Rpc::AppendEntry(ae));
        // Optimistic: the next round continues after what was just sent.
        self.set_next(peer, next + sent);
        Ok(())
    }

    fn send_snapshot(&mut self, peer: &PeerId) -> Result<()> {
        let Snapshot {
            last_index,
            last_term,
            data,
        } = self.store.snapshot().clone();
        debug!(
            "[{}] sending snapshot {}/{} to {}",
            self.id, last_index, last_term, peer
        );
        let msg = InstallSnapshot {
            leader: self.id.clone(),
            term: self.term,
            last_index,
            last_term,
            data,
        };
        self.send(peer, Rpc::InstallSnapshot(msg));
        self.set_next(peer, last_index + 1);
        Ok(())
    }

    pub(super) fn handle_append_entry_response(&mut self, resp: AppendEntryResponse) -> Result<()> {
        if resp.term > self.term {
            return self.become_follower(resp.term, None);
        }
        if resp.term < self.term {
            return Ok(());
        }

        let last_index = self.store.last_index();
        let resend = match &mut self.role {
            Role::Leader { progress, .. } => {
                let Some(p) = progress.get_mut(&resp.peer) else {
                    return Ok(());
                };
                p.last_contact = Instant::now();
                if resp.success {
                    let index = resp.index.min(last_index);
                    if index > p.matched {
                        p.matched = index;
                    }
                    if p.next <= p.matched {
                        p.next = p.matched + 1;
                    }
                    p.next <= last_index
                } else {
                    // Retreat to the follower's hint, never below what it already confirmed.
                    p.next = (resp.index + 1).max(p.matched + 1).min(last_index + 1);
                    true
                }
            }
            _ => return Ok(()),
        };

        if resend {
            self.send_append(&resp.peer)?;
        }
        if resp.success {
            self.maybe_advance_commit()?;
        }
        Ok(())
    }

    /// Moves `commit` to the highest index stored on a majority, if that entry is
    /// from the current term, and applies up to it.
    pub(super) fn maybe_advance_commit(&mut self) -> Result<()> {
        let mut matched: Vec<u64> = match &self.role {
            Role::Leader { progress, .. } => progress.values().map(|p| p.matched).collect(),
            _ => return Ok(()),
        };
        matched.push(self.store.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum() - 1];
        if candidate <= self.commit {
            return Ok(());
        }
        match self.store.term(candidate) {
            Ok(term) if term == self.term => {}
            _ => return Ok(()),
        }

        self.commit = candidate;
        self.apply_committed()?;
        // Let followers learn the new commit without waiting for the next heartbeat.
        self.replicate_all()
    }

    pub(super) fn handle_append_entry(&mut self, ae: AppendEntry) -> Result<()> {
        let Some(leader) = ae.leader_id() else {
            debug!("[{}] ignoring append entry without a leader", self.id);
            return Ok(());
        };

        if ae.term < self.term {
            self.respond_append(&leader, false, self.store.last_index());
            return Ok(());
        }
        if ae.term == self.term && self.is_leader() {
            warn!(
                "[{}] ignoring append entry from {}: already leader in term {}",
                self.id, leader, self.term
            );
            return Ok(());
        }
        if ae.term > self.term
            || !matches!(self.role, Role::Follower)
            || self.leader.as_ref() != Some(&leader)
        {
            self.become_follower(ae.term, Some(leader.clone()))?;
        } else {
            self.reset_election_deadline();
        }

        let boundary = self.store.snapshot().last_index;
        let mut pindex = ae.pindex;
        let mut entries = ae.entries;
        if pindex < boundary {
            // Everything up to the boundary is already committed here.
            let skip = ((boundary - pindex) as usize).min(entries.len());
            entries.drain(..skip);
            pindex += skip as u64;
            if pindex < boundary {
                self.respond_append(&leader, true, pindex);
                return Ok(());
            }
        } else {
            match self.store.term(pindex) {
                Ok(term) if term == ae.pterm => {}
                Ok(_) | Err(LogError::NotFound(_)) => {
                    let last_index = self.store.last_index();
                    let hint = if pindex > last_index {
                        last_index
                    } else {
                        self.commit
                    };
                    debug!(
                        "[{}] rejecting append at {}/{} from {}, hint {}",
                        self.id, ae.pindex, ae.pterm, leader, hint
                    );
                    self.respond_append(&leader, false, hint);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let verified = pindex + entries.len() as u64;
        let mut index = pindex;
        let mut to_append = Vec::new();
        for entry in entries {
            index += 1;
            if to_append.is_empty() {
                match self.store.term(index) {
                    Ok(term) if term == entry.term => continue,
                    Ok(_) => {
                        if index <= self.commit {
                            return Err(RaftError::Halted(format!(
                                "leader {} conflicts with committed entry {}",
                                leader, index
                            )));
                        }
                        warn!(
                            "[{}] truncating conflicting entries after {}",
                            self.id,
                            index - 1
                        );
                        self.store.truncate_after(index - 1)?;
                        self.pending.notice_truncated(index - 1);
                    }
                    Err(LogError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            to_append.push(entry.at(index));
        }
        if !to_append.is_empty() {
            self.store.append_entries(to_append)?;
        }

        let commit = ae.commit.min(verified);
        if commit > self.commit {
            self.commit = commit;
            self.apply_committed()?;
        }
        self.respond_append(&leader, true, verified);
        Ok(())
    }

    fn respond_append(&self, leader: &PeerId, success: bool, index: u64) {
        let response = Rpc::AppendEntryResponse(AppendEntryResponse {
            term: self.term,
            index,
            peer: self.id.clone(),
            success,
        });
        self.send(leader, response);
    }

    pub(super) fn handle_install_snapshot(&mut self, s: InstallSnapshot) -> Result<()> {
        if s.term < self.term {
            self.respond_append(&s.leader, false, self.store.last_index());
            return Ok(());
        }
        if s.term == self.term && self.is_leader() {
            return Ok(());
        }
        if s.term > self.term
            || !matches!(self.role, Role::Follower)
            || self.leader.as_ref() != Some(&s.leader)
        {
            self.become_follower(s.term, Some(s.leader.clone()))?;
        } else {
            self.reset_election_deadline();
        }

        if s.last_index <= self.commit {
            self.respond_append(&s.leader, true, s.last_index);
            return Ok(());
        }

        info!(
            "[{}] installing snapshot {}/{} from {}",
            self.id, s.last_index, s.last_term, s.leader
        );
        self.state_machine.restore(&s.data)?;
        self.store.install_snapshot(Snapshot {
            last_index: s.last_index,
            last_term: s.last_term,
            data: s.data,
        })?;
        self.commit = s.last_index;
        self.applied = s.last_index;
        self.pending.fail_all(|| RaftError::ProposalDropped);
        self.persist_hard_state()?;
        metrics::SNAPSHOTS
            .with_label_values(&[self.id.as_str(), "installed"])
            .inc();

        self.respond_append(&s.leader, true, s.last_index);
        Ok(())
    }

    pub(super) fn handle_forward_proposal(&mut self, p: ForwardProposal) -> Result<()> {
        if !self.is_leader() {
            debug!(
                "[{}] dropping proposal forwarded by {}: not leader",
                self.id, p.from
            );
            return Ok(());
        }
        let (proposal, _rx) = Proposal::normal(p.data);
        self.propose(proposal)
    }
}
