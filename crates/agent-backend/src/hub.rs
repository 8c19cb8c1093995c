//! Single-listener event fan-in for backend sessions
//!
//! A session has at most one active listener: the send in flight. Subscribing
//! replaces any previous listener, and releasing a subscription only detaches
//! it if it is still the active one, so a late release from an earlier send
//! never cuts off the current one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use crate::event::BackendEvent;

struct Slot {
    id: u64,
    tx: mpsc::UnboundedSender<BackendEvent>,
}

/// Routes a session's events to its current subscriber.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    slot: Mutex<Option<Slot>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new listener, detaching any previous one.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Slot { id, tx });
        Subscription {
            id,
            rx,
            hub: Some(self.inner.clone()),
        }
    }

    /// Deliver an event to the active listener.
    ///
    /// Returns false when nobody is listening; the event is dropped.
    pub fn publish(&self, event: BackendEvent) -> bool {
        let slot = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(s) => s.tx.send(event).is_ok(),
            None => {
                trace!(?event, "dropping event with no subscriber");
                false
            }
        }
    }

    /// Whether a listener is currently attached.
    pub fn has_subscriber(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl HubInner {
    fn release(&self, id: u64) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
        }
    }
}

/// Handle to an attached listener.
///
/// Released exactly once: either explicitly via `release`, which consumes the
/// handle, or implicitly on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<BackendEvent>,
    hub: Option<Arc<HubInner>>,
}

impl Subscription {
    /// Wait for the next event. Returns None once the session can no longer
    /// deliver events to this listener.
    pub async fn recv(&mut self) -> Option<BackendEvent> {
        self.rx.recv().await
    }

    /// Detach from the session.
    pub fn release(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(hub) = self.hub.take() {
            hub.release(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(s: &str) -> BackendEvent {
        BackendEvent::MessageDelta { content: s.into() }
    }

    #[tokio::test]
    async fn delivers_to_active_subscriber() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        assert!(hub.publish(delta("a")));
        assert_eq!(sub.recv().await, Some(delta("a")));
    }

    #[test]
    fn publish_without_subscriber_is_dropped() {
        let hub = EventHub::new();
        assert!(!hub.publish(BackendEvent::Idle));
    }

    #[tokio::test]
    async fn newer_subscription_wins() {
        let hub = EventHub::new();
        let mut old = hub.subscribe();
        let mut new = hub.subscribe();

        hub.publish(delta("x"));
        assert_eq!(new.recv().await, Some(delta("x")));

        // Old sender was replaced, so the old receiver sees end-of-stream
        assert_eq!(old.recv().await, None);
    }

    #[test]
    fn stale_release_does_not_detach_current_listener() {
        let hub = EventHub::new();
        let old = hub.subscribe();
        let _new = hub.subscribe();

        old.release();
        assert!(hub.has_subscriber());
    }

    #[test]
    fn release_and_drop_detach() {
        let hub = EventHub::new();
        let sub = hub.subscribe();
        sub.release();
        assert!(!hub.has_subscriber());

        {
            let _sub = hub.subscribe();
            assert!(hub.has_subscriber());
        }
        assert!(!hub.has_subscriber());
    }
}
