//! Status broadcaster.
//!
//! Two delivery paths for the same event stream:
//! - callback listeners registered with [`StatusBroadcaster::add_listener`],
//!   removed when their [`ListenerGuard`] is dropped;
//! - async subscribers via [`StatusBroadcaster::subscribe`] (tokio broadcast).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::broadcast;

use quill_core::SyncStatusEvent;

type Listener = Arc<dyn Fn(&SyncStatusEvent) + Send + Sync>;
type ListenerTable = Mutex<Vec<(u64, Listener)>>;

const CHANNEL_CAPACITY: usize = 256;

pub struct StatusBroadcaster {
    listeners: Arc<ListenerTable>,
    next_id: AtomicU64,
    tx: broadcast::Sender<SyncStatusEvent>,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Register a callback for every future event.
    pub fn add_listener(
        &self,
        listener: impl Fn(&SyncStatusEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        ListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncStatusEvent> {
        self.tx.subscribe()
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every listener and subscriber.
    ///
    /// Listeners run outside the table lock, so a listener may register or
    /// dispose listeners. A panicking listener is logged and skipped.
    pub fn publish(&self, event: SyncStatusEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::warn!(event = ?event, "status listener panicked");
            }
        }

        // No receivers is fine; the send error only reports that.
        let _ = self.tx.send(event);
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposable handle for a callback listener. Dropping it unregisters.
#[must_use = "dropping the guard immediately unregisters the listener"]
pub struct ListenerGuard {
    id: u64,
    listeners: Weak<ListenerTable>,
}

impl ListenerGuard {
    /// Unregister now. Equivalent to dropping the guard.
    pub fn dispose(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn listener_receives_until_disposed() {
        let broadcaster = StatusBroadcaster::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let guard = broadcaster.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.publish(SyncStatusEvent::Started);
        broadcaster.publish(SyncStatusEvent::Completed);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        guard.dispose();
        assert_eq!(broadcaster.listener_count(), 0);
        broadcaster.publish(SyncStatusEvent::Started);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_starve_others() {
        let broadcaster = StatusBroadcaster::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _bad = broadcaster.add_listener(|_| panic!("listener bug"));
        let _good = broadcaster.add_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        broadcaster.publish(SyncStatusEvent::Completed);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let broadcaster = StatusBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        broadcaster.publish(SyncStatusEvent::Started);
        broadcaster.publish(SyncStatusEvent::stage("Uploading changes"));
        broadcaster.publish(SyncStatusEvent::Completed);

        assert_eq!(rx.recv().await.expect("started"), SyncStatusEvent::Started);
        assert_eq!(
            rx.recv().await.expect("progress").stage_text().as_deref(),
            Some("Uploading changes")
        );
        assert!(rx.recv().await.expect("completed").is_terminal());
    }

    #[test]
    fn guard_outliving_broadcaster_is_harmless() {
        let broadcaster = StatusBroadcaster::new();
        let guard = broadcaster.add_listener(|_| {});
        drop(broadcaster);
        drop(guard);
    }
}
