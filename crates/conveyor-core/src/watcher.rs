//! The watcher capability and per-entity fan-out.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::update::{Delivery, Update};

/// A registered consumer of updates from one watchable entity.
///
/// `on_update` must not block: transports hand the delivery to a queue
/// and drain it from their own task.
pub trait Watcher: Send + Sync {
    fn on_update(&self, delivery: Delivery);
}

/// Handle returned by [`WatchHub::watch`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherId(u64);

/// The ordered set of watchers attached to one build or job.
///
/// Updates fan out synchronously, in publication order, to every
/// watcher registered at that instant. Closing delivers the sentinel
/// exactly once per watcher; afterwards the hub is inert and late
/// registrations receive only the sentinel, never a replay.
///
/// Delivery iterates over a snapshot taken outside the lock, so a
/// watcher may call `watch`/`unwatch` from inside its own callback.
pub struct WatchHub {
    inner: Mutex<HubInner>,
}

struct HubInner {
    watchers: Vec<(WatcherId, Arc<dyn Watcher>)>,
    next_id: u64,
    closed: bool,
}

impl WatchHub {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                watchers: Vec::new(),
                next_id: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().expect("watcher list lock poisoned")
    }

    /// Register a watcher and return its handle.
    pub fn watch(&self, watcher: Arc<dyn Watcher>) -> WatcherId {
        let (id, closed) = {
            let mut inner = self.lock();
            let id = WatcherId(inner.next_id);
            inner.next_id += 1;
            if !inner.closed {
                inner.watchers.push((id, watcher.clone()));
            }
            (id, inner.closed)
        };
        if closed {
            watcher.on_update(Delivery::Closed);
        }
        id
    }

    /// Unregister a watcher. Unknown handles are a no-op.
    pub fn unwatch(&self, id: WatcherId) {
        self.lock().watchers.retain(|(wid, _)| *wid != id);
    }

    /// Deliver an update to every currently registered watcher, in
    /// registration order. No-op once the hub is closed.
    pub fn publish(&self, update: Update) {
        let targets: Vec<Arc<dyn Watcher>> = {
            let inner = self.lock();
            if inner.closed {
                return;
            }
            inner.watchers.iter().map(|(_, w)| w.clone()).collect()
        };
        for watcher in targets {
            watcher.on_update(Delivery::Update(update.clone()));
        }
    }

    /// Deliver the sentinel to every registered watcher and seal the
    /// hub. Idempotent.
    pub fn close(&self) {
        let targets: Vec<Arc<dyn Watcher>> = {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.watchers.drain(..).map(|(_, w)| w).collect()
        };
        for watcher in targets {
            watcher.on_update(Delivery::Closed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Watcher backed by an unbounded channel. The subscribing transport
/// drains the receiving end from its own task, preserving FIFO order.
pub struct ChannelWatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelWatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Watcher for ChannelWatcher {
    fn on_update(&self, delivery: Delivery) {
        // a dropped receiver means the subscriber went away
        let _ = self.tx.send(delivery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::RunStatus;
    use std::sync::OnceLock;
    use tokio::sync::mpsc::error::TryRecvError;

    fn state_update(job: &str, state: RunStatus) -> Update {
        Update::JobState {
            job: job.to_string(),
            state,
            text: String::new(),
        }
    }

    #[test]
    fn test_delivery_order_and_sentinel() {
        let hub = WatchHub::new();
        let (watcher, mut rx) = ChannelWatcher::new();
        hub.watch(watcher);

        hub.publish(state_update("a", RunStatus::Running));
        hub.publish(state_update("b", RunStatus::Running));
        hub.publish(state_update("a", RunStatus::Success));
        hub.close();

        let mut jobs = Vec::new();
        loop {
            match rx.try_recv().unwrap() {
                Delivery::Update(u) => jobs.push(u.job_name().unwrap().to_string()),
                Delivery::Closed => break,
            }
        }
        assert_eq!(jobs, vec!["a", "b", "a"]);
        // nothing after the sentinel
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let hub = WatchHub::new();
        let (watcher, mut rx) = ChannelWatcher::new();
        hub.watch(watcher);

        hub.close();
        hub.close();
        hub.publish(state_update("a", RunStatus::Running));

        assert!(matches!(rx.try_recv(), Ok(Delivery::Closed)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_unwatch_stops_delivery() {
        let hub = WatchHub::new();
        let (watcher, mut rx) = ChannelWatcher::new();
        let id = hub.watch(watcher);

        hub.publish(state_update("a", RunStatus::Running));
        hub.unwatch(id);
        // unknown or already-removed handles are a no-op
        hub.unwatch(id);
        hub.publish(state_update("b", RunStatus::Running));

        assert!(matches!(rx.try_recv(), Ok(Delivery::Update(_))));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn test_late_watch_gets_sentinel_only() {
        let hub = WatchHub::new();
        hub.publish(state_update("a", RunStatus::Running));
        hub.close();

        let (watcher, mut rx) = ChannelWatcher::new();
        hub.watch(watcher);

        assert!(matches!(rx.try_recv(), Ok(Delivery::Closed)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    struct SelfRemovingWatcher {
        hub: Arc<WatchHub>,
        id: OnceLock<WatcherId>,
        tx: mpsc::UnboundedSender<Delivery>,
    }

    impl Watcher for SelfRemovingWatcher {
        fn on_update(&self, delivery: Delivery) {
            let _ = self.tx.send(delivery);
            if let Some(id) = self.id.get() {
                self.hub.unwatch(*id);
            }
        }
    }

    #[test]
    fn test_unwatch_from_inside_callback() {
        let hub = Arc::new(WatchHub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(SelfRemovingWatcher {
            hub: hub.clone(),
            id: OnceLock::new(),
            tx,
        });
        let id = hub.watch(watcher.clone());
        watcher.id.set(id).unwrap();

        hub.publish(state_update("a", RunStatus::Running));
        hub.publish(state_update("b", RunStatus::Running));

        // the first delivery removed the watcher; the second never arrives
        assert!(matches!(rx.try_recv(), Ok(Delivery::Update(_))));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
