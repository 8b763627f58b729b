use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use crate::raft::error::RaftError;

pub type ProposalResult = Result<u64, RaftError>;

/// A client proposal waiting for its entry to be applied.
pub struct Proposal {
    pub data: Vec<u8>,
    // Set once the leader appends the entry.
    pub term: u64,
    pub index: u64,
    pub propose_success: Option<Sender<ProposalResult>>,
}

impl Proposal {
    pub fn normal(data: Vec<u8>) -> (Self, Receiver<ProposalResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            data,
            term: 0,
            index: 0,
            propose_success: Some(tx),
        };
        (proposal, rx)
    }

    pub fn complete(mut self, result: ProposalResult) {
        if let Some(sender) = self.propose_success.take() {
            let _ = sender.send(result);
        }
    }
}

/// Proposals appended to the log, oldest first.
#[derive(Default)]
pub struct PendingProposals {
    proposed: VecDeque<Proposal>,
}

impl PendingProposals {
    pub fn push(&mut self, proposal: Proposal) {
        self.proposed.push_back(proposal);
    }

    pub fn len(&self) -> usize {
        self.proposed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposed.is_empty()
    }

    /// Settles every proposal at or below `applied`. `term_at` reports the term
    /// of the entry that was applied at a given index: a different term means
    /// another leader overwrote the proposal.
    pub fn notice_applied<F>(&mut self, applied: u64, term_at: F)
    where
        F: Fn(u64) -> Option<u64>,
    {
        while let Some(front) = self.proposed.front() {
            if front.index > applied {
                break;
            }
            let Some(proposal) = self.proposed.pop_front() else {
                break;
            };
            let result = match term_at(proposal.index) {
                Some(term) if term == proposal.term => Ok(proposal.index),
                _ => Err(RaftError::ProposalDropped),
            };
            proposal.complete(result);
        }
    }

    /// Fails proposals whose entries were truncated out of the log.
    pub fn notice_truncated(&mut self, after: u64) {
        while self
            .proposed
            .back()
            .map(|p| p.index > after)
            .unwrap_or(false)
        {
            if let Some(proposal) = self.proposed.pop_back() {
                proposal.complete(Err(RaftError::ProposalDropped));
            }
        }
    }

    /// Fails everything, used when the node stops or halts.
    pub fn fail_all<F>(&mut self, err: F)
    where
        F: Fn() -> RaftError,
    {
        for proposal in self.proposed.drain(..) {
            proposal.complete(Err(err()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposed(term: u64, index: u64) -> (Proposal, Receiver<ProposalResult>) {
        let (mut p, rx) = Proposal::normal(Vec::new());
        p.term = term;
        p.index = index;
        (p, rx)
    }

    #[test]
    fn test_notice_applied_in_order() {
        let mut pending = PendingProposals::default();
        let (p2, mut rx2) = proposed(1, 2);
        let (p3, mut rx3) = proposed(1, 3);
        pending.push(p2);
        pending.push(p3);

        pending.notice_applied(2, |_| Some(1));
        assert_eq!(rx2.try_recv().unwrap().unwrap(), 2);
        assert!(rx3.try_recv().is_err());
        assert_eq!(pending.len(), 1);

        pending.notice_applied(3, |_| Some(2));
        assert!(matches!(
            rx3.try_recv().unwrap(),
            Err(RaftError::ProposalDropped)
        ));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_notice_truncated_and_fail_all() {
        let mut pending = PendingProposals::default();
        let (p2, mut rx2) = proposed(1, 2);
        let (p3, mut rx3) = proposed(1, 3);
        pending.push(p2);
        pending.push(p3);

        pending.notice_truncated(2);
        assert!(matches!(
            rx3.try_recv().unwrap(),
            Err(RaftError::ProposalDropped)
        ));

        pending.fail_all(|| RaftError::Stopped);
        assert!(matches!(rx2.try_recv().unwrap(), Err(RaftError::Stopped)));
    }
}
