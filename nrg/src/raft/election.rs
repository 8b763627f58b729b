//! Leader election: campaigning, voting and leadership hand-off.

use std::collections::{HashMap, HashSet};

use log::{debug, info};
use tokio::time::Instant;

use crate::metrics;
use crate::raft::codec::{Rpc, TimeoutNow, VoteRequest, VoteResponse};
use crate::raft::entry::{EntryKind, LogEntry};
use crate::raft::error::{RaftError, Result};
use crate::raft::node::{Progress, RaftNode, Role};
use crate::raft::{PeerId, StateMachine};

impl<S: StateMachine> RaftNode<S> {
    /// Called when no leader was heard from before the election deadline.
    pub(super) fn election_timeout(&mut self) -> Result<()> {
        if let Role::Candidate { .. } = self.role {
            // Split vote: back off to follower and wait out a fresh randomized timeout.
            info!("[{}] election for term {} timed out", self.id, self.term);
            self.role = Role::Follower;
            self.reset_election_deadline();
            return Ok(());
        }
        self.campaign()
    }

    pub(super) fn campaign(&mut self) -> Result<()> {
        self.term += 1;
        self.voted_for = Some(self.id.clone());
        self.leader = None;
        self.persist_hard_state()?;
        metrics::ELECTIONS
            .with_label_values(&[self.id.as_str()])
            .inc();

        let mut votes = HashSet::new();
        votes.insert(self.id.clone());
        self.role = Role::Candidate { votes };
        self.reset_election_deadline();
        info!("[{}] campaigning for term {}", self.id, self.term);

        if self.quorum() <= 1 {
            return self.become_leader();
        }

        let request = Rpc::VoteRequest(VoteRequest {
            term: self.term,
            last_term: self.store.last_term(),
            last_index: self.store.last_index(),
            candidate: self.id.clone(),
        });
        self.broadcast(&request);
        Ok(())
    }

    pub(super) fn handle_vote_request(&mut self, req: VoteRequest) -> Result<()> {
        if req.term > self.term {
            // Only a granted vote defers our own election; a candidate with a
            // stale log must not keep the rest of the group from campaigning.
            let was_follower = matches!(self.role, Role::Follower);
            let deadline = self.election_deadline;
            self.become_follower(req.term, None)?;
            if was_follower {
                self.election_deadline = deadline;
            }
        }

        let up_to_date =
            (req.last_term, req.last_index) >= (self.store.last_term(), self.store.last_index());
        let free = match &self.voted_for {
            None => true,
            Some(voted) => *voted == req.candidate,
        };
        let granted = req.term == self.term && free && up_to_date;
        if granted {
            self.voted_for = Some(req.candidate.clone());
            self.persist_hard_state()?;
            self.reset_election_deadline();
        }
        debug!(
            "[{}] vote for {} in term {}: {}",
            self.id, req.candidate, req.term, granted
        );

        let response = Rpc::VoteResponse(VoteResponse {
            term: self.term,
            peer: self.id.clone(),
            granted,
        });
        self.send(&req.candidate, response);
        Ok(())
    }

    pub(super) fn handle_vote_response(&mut self, resp: VoteResponse) -> Result<()> {
        if resp.term > self.term {
            return self.become_follower(resp.term, None);
        }
        if resp.term != self.term || !resp.granted {
            return Ok(());
        }

        let quorum = self.quorum();
        let won = match &mut self.role {
            Role::Candidate { votes } => {
                votes.insert(resp.peer);
                votes.len() >= quorum
            }
            _ => false,
        };
        if won {
            self.become_leader()?;
        }
        Ok(())
    }

    pub(super) fn become_leader(&mut self) -> Result<()> {
        let now = Instant::now();
        let next = self.store.last_index() + 1;
        let progress: HashMap<PeerId, Progress> = self
            .peers
            .iter()
            .map(|peer| {
                let progress = Progress {
                    next,
                    matched: 0,
                    last_contact: now,
                };
                (peer.clone(), progress)
            })
            .collect();
        self.role = Role::Leader {
            progress,
            next_heartbeat: now,
            since: now,
        };
        self.leader = Some(self.id.clone());
        metrics::LEADER_CHANGES
            .with_label_values(&[self.id.as_str()])
            .inc();
        info!("[{}] became leader for term {}", self.id, self.term);

        // Entries from earlier terms only commit through an entry of this term.
        if self.commit < self.store.last_index() {
            let marker = LogEntry::new(
                self.term,
                next,
                EntryKind::LeaderChange,
                self.id.as_bytes().to_vec(),
            );
            self.store.append(marker)?;
        }

        self.replicate_all()?;
        self.maybe_advance_commit()
    }

    /// Adopts `term` (when newer) and follows `leader`.
    pub(super) fn become_follower(&mut self, term: u64, leader: Option<PeerId>) -> Result<()> {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        if !matches!(self.role, Role::Follower) {
            info!("[{}] stepping down in term {}", self.id, self.term);
            self.role = Role::Follower;
        }
        if leader != self.leader {
            if let Some(leader) = &leader {
                info!("[{}] following {} in term {}", self.id, leader, self.term);
            }
            self.leader = leader;
        }
        self.reset_election_deadline();
        Ok(())
    }

    /// Hands leadership to the most caught-up follower.
    pub(super) fn step_down(&mut self) -> Result<()> {
        let successor = match &self.role {
            Role::Leader { progress, .. } => progress
                .iter()
                .max_by_key(|(_, p)| p.matched)
                .map(|(peer, _)| peer.clone()),
            _ => {
                return Err(RaftError::NotLeader {
                    leader: self.leader.clone(),
                })
            }
        };

        info!("[{}] stepping down from term {}", self.id, self.term);
        if let Some(successor) = &successor {
            let timeout_now = Rpc::TimeoutNow(TimeoutNow {
                term: self.term,
                leader: self.id.clone(),
            });
            self.send(successor, timeout_now);
        }
        self.role = Role::Follower;
        self.leader = None;
        // Stay out of the way while the successor campaigns.
        self.reset_election_deadline();
        self.election_deadline += self.config.election_timeout_max();
        Ok(())
    }

    pub(super) fn handle_timeout_now(&mut self, t: TimeoutNow) -> Result<()> {
        if t.term != self.term || self.leader.as_ref() != Some(&t.leader) || self.is_leader() {
            debug!(
                "[{}] ignoring timeout-now from {} for term {}",
                self.id, t.leader, t.term
            );
            return Ok(());
        }
        info!("[{}] leadership handed over by {}", self.id, t.leader);
        self.campaign()
    }
}
