use crate::models::{ChangeEvent, PushMessage, TreeNode};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};

pub type ObserverId = u64;

/// Handle returned by [`BroadcastHub::connect`]: the observer's id and the
/// ordered stream of messages addressed to it.
pub struct Observer {
    pub id: ObserverId,
    pub receiver: mpsc::Receiver<PushMessage>,
}

#[derive(Default)]
struct HubState {
    observers: HashMap<ObserverId, mpsc::Sender<PushMessage>>,
    latest: Option<Arc<TreeNode>>,
}

/// Fans snapshots and change events out to every connected observer.
///
/// Each observer owns a bounded queue and delivery never waits on it: a full
/// queue drops the message for that observer only, a closed one removes the
/// observer. Registration and broadcast share one lock so a new observer
/// always starts from exactly the latest snapshot and then sees every later
/// message in emission order.
pub struct BroadcastHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        BroadcastHub {
            state: Mutex::new(HubState::default()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a queue for a new observer and registers it.
    pub fn connect(&self) -> Observer {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.register(id, tx);
        Observer { id, receiver: rx }
    }

    /// Registers `sender` under `id` and hands it the latest snapshot, if any.
    /// Past change events are not replayed.
    pub fn register(&self, id: ObserverId, sender: mpsc::Sender<PushMessage>) {
        let mut state = self.lock();
        if let Some(tree) = &state.latest {
            if let Err(e) = sender.try_send(PushMessage::Snapshot(tree.clone())) {
                debug!("Initial snapshot not delivered to observer {}: {}", id, e);
            }
        }
        state.observers.insert(id, sender);
        info!("Observer {} connected ({} total)", id, state.observers.len());
    }

    pub fn unregister(&self, id: ObserverId) {
        let mut state = self.lock();
        if state.observers.remove(&id).is_some() {
            info!("Observer {} disconnected ({} remaining)", id, state.observers.len());
        }
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    pub fn latest_snapshot(&self) -> Option<Arc<TreeNode>> {
        self.lock().latest.clone()
    }

    pub fn broadcast(&self, event: ChangeEvent) {
        let mut state = self.lock();
        Self::deliver(&mut state, PushMessage::Change(event));
    }

    /// Stores `tree` as the latest snapshot and delivers it to everyone.
    pub fn broadcast_snapshot(&self, tree: TreeNode) {
        let tree = Arc::new(tree);
        let mut state = self.lock();
        state.latest = Some(tree.clone());
        Self::deliver(&mut state, PushMessage::Snapshot(tree));
    }

    /// Change first, then the snapshot that already reflects it, under one
    /// lock so no observer sees the pair split or reordered.
    pub fn publish(&self, event: ChangeEvent, tree: TreeNode) {
        let tree = Arc::new(tree);
        let mut state = self.lock();
        state.latest = Some(tree.clone());
        Self::deliver(&mut state, PushMessage::Change(event));
        Self::deliver(&mut state, PushMessage::Snapshot(tree));
    }

    fn deliver(state: &mut HubState, message: PushMessage) {
        let mut closed = Vec::new();
        for (id, sender) in &state.observers {
            match sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Observer {} is lagging, dropped a {} message", id, message.event_name());
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            state.observers.remove(&id);
            debug!("Removed closed observer {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, NodeKind};

    fn tree(name: &str) -> TreeNode {
        TreeNode {
            name: name.to_string(),
            kind: NodeKind::Directory,
            relative_path: String::new(),
            extension: None,
            size_bytes: None,
            children: Vec::new(),
        }
    }

    fn change(path: &str) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Modified,
            relative_path: path.to_string(),
            content: Some("x".into()),
        }
    }

    #[test]
    fn new_observer_gets_exactly_the_current_snapshot() {
        let hub = BroadcastHub::new(8);
        hub.broadcast_snapshot(tree("old"));
        hub.broadcast(change("a.py"));
        hub.broadcast_snapshot(tree("current"));

        let mut observer = hub.connect();
        match observer.receiver.try_recv().unwrap() {
            PushMessage::Snapshot(t) => assert_eq!(t.name, "current"),
            other => panic!("expected snapshot, got {:?}", other),
        }
        assert!(observer.receiver.try_recv().is_err());
    }

    #[test]
    fn observer_before_first_snapshot_gets_nothing_on_register() {
        let hub = BroadcastHub::new(8);
        let mut observer = hub.connect();
        assert!(observer.receiver.try_recv().is_err());
    }

    #[test]
    fn publish_preserves_change_then_snapshot_order_per_observer() {
        let hub = BroadcastHub::new(16);
        let mut a = hub.connect();
        let mut b = hub.connect();
        hub.publish(change("one.py"), tree("t1"));
        hub.publish(change("two.py"), tree("t2"));

        for observer in [&mut a, &mut b] {
            let names: Vec<&'static str> = (0..4)
                .map(|_| observer.receiver.try_recv().unwrap().event_name())
                .collect();
            assert_eq!(names, vec!["change", "snapshot", "change", "snapshot"]);
        }
    }

    #[test]
    fn closed_observer_does_not_affect_others() {
        let hub = BroadcastHub::new(8);
        let gone = hub.connect();
        let mut alive = hub.connect();
        drop(gone.receiver);

        hub.broadcast(change("a.py"));
        assert!(matches!(alive.receiver.try_recv(), Ok(PushMessage::Change(_))));
        assert_eq!(hub.observer_count(), 1);
    }

    #[test]
    fn full_observer_queue_drops_without_blocking_others() {
        let hub = BroadcastHub::new(1);
        let mut slow = hub.connect();
        let mut fast = hub.connect();

        hub.broadcast(change("first.py"));
        let _ = fast.receiver.try_recv();
        hub.broadcast(change("second.py"));

        match fast.receiver.try_recv().unwrap() {
            PushMessage::Change(e) => assert_eq!(e.relative_path, "second.py"),
            other => panic!("unexpected {:?}", other),
        }
        match slow.receiver.try_recv().unwrap() {
            PushMessage::Change(e) => assert_eq!(e.relative_path, "first.py"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hub.observer_count(), 2);
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = BroadcastHub::new(8);
        let observer = hub.connect();
        hub.unregister(observer.id);
        hub.unregister(observer.id);
        assert_eq!(hub.observer_count(), 0);
    }
}
