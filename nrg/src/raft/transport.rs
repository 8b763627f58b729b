//! Message delivery between group members.
//!
//! The core only needs fire-and-forget delivery of raw bytes. Loss, duplication
//! and reordering are all tolerated by the protocol.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::raft::PeerId;

pub trait Transport: Send + Sync + 'static {
    /// Sends `bytes` from `from` to `to`. Never blocks and never reports failure.
    fn send(&self, from: &PeerId, to: &PeerId, bytes: Vec<u8>);
}

#[derive(Default)]
struct RouterState {
    inboxes: HashMap<PeerId, UnboundedSender<Vec<u8>>>,
    isolated: HashSet<PeerId>,
}

/// In-process transport: one unbounded channel per registered member.
#[derive(Clone, Default)]
pub struct LocalRouter {
    state: Arc<Mutex<RouterState>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        LocalRouter::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates the inbox of `id`, replacing any previous one.
    pub fn register(&self, id: &PeerId) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(id.clone(), tx);
        rx
    }

    pub fn unregister(&self, id: &PeerId) {
        self.lock().inboxes.remove(id);
    }

    /// Drops all traffic to and from `id` until [`LocalRouter::heal`].
    pub fn isolate(&self, id: &PeerId) {
        self.lock().isolated.insert(id.clone());
    }

    pub fn heal(&self, id: &PeerId) {
        self.lock().isolated.remove(id);
    }
}

impl Transport for LocalRouter {
    fn send(&self, from: &PeerId, to: &PeerId, bytes: Vec<u8>) {
        let state = self.lock();
        if state.isolated.contains(from) || state.isolated.contains(to) {
            return;
        }
        match state.inboxes.get(to) {
            Some(inbox) => {
                if inbox.send(bytes).is_err() {
                    log::trace!("inbox of {} is closed, dropping message from {}", to, from);
                }
            }
            None => log::trace!("no route to {}, dropping message from {}", to, from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_delivery_and_isolation() {
        let router = LocalRouter::new();
        let a = PeerId::new("AAAAAAAA").unwrap();
        let b = PeerId::new("BBBBBBBB").unwrap();
        let mut inbox_b = router.register(&b);

        router.send(&a, &b, vec![1]);
        assert_eq!(inbox_b.try_recv().unwrap(), vec![1]);

        router.isolate(&a);
        router.send(&a, &b, vec![2]);
        assert!(inbox_b.try_recv().is_err());

        router.heal(&a);
        router.send(&a, &b, vec![3]);
        assert_eq!(inbox_b.try_recv().unwrap(), vec![3]);

        router.unregister(&b);
        router.send(&a, &b, vec![4]);
        assert!(inbox_b.try_recv().is_err());
    }
}
