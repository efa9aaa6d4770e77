//! In-process event bus with per-publish delivery mode.
//!
//! `Immediate` events reach every handler before `publish` returns.
//! `Deferred` events are appended to a FIFO scheduler queue and delivered by
//! [`CoreEventBus::flush`], which the runtime calls from its pump task once the
//! publishing operation has finished its turn. Flushes are serialised, so
//! concurrent flushers never reorder deferred events.

use crate::types::events::Event;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Immediate,
    Deferred,
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Event);
}

type Waker = Arc<dyn Fn() + Send + Sync>;

/// Handlers are held weakly so that owners can register themselves without
/// creating reference cycles; dropped handlers are pruned on the next publish.
#[derive(Default)]
pub struct CoreEventBus {
    handlers: RwLock<Vec<Weak<dyn EventHandler>>>,
    deferred: Mutex<VecDeque<Event>>,
    flushing: Mutex<()>,
    waker: RwLock<Option<Waker>>,
}

impl CoreEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("RwLock should not be poisoned")
            .push(Arc::downgrade(&handler));
    }

    /// Returns true if there are any live handlers registered.
    pub fn has_handlers(&self) -> bool {
        self.handlers
            .read()
            .expect("RwLock should not be poisoned")
            .iter()
            .any(|h| h.strong_count() > 0)
    }

    /// Called whenever a deferred event is queued.
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *self.waker.write().expect("RwLock should not be poisoned") = Some(Arc::new(waker));
    }

    pub fn publish(&self, event: Event, delivery: Delivery) {
        match delivery {
            Delivery::Immediate => self.dispatch(&event),
            Delivery::Deferred => {
                self.deferred
                    .lock()
                    .expect("Mutex should not be poisoned")
                    .push_back(event);
                let waker = self
                    .waker
                    .read()
                    .expect("RwLock should not be poisoned")
                    .clone();
                if let Some(wake) = waker {
                    wake();
                }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.deferred
            .lock()
            .expect("Mutex should not be poisoned")
            .len()
    }

    /// Delivers queued deferred events in publish order, including any that
    /// handlers queue while the flush is running. Returns how many were sent.
    ///
    /// Blocks while another flush is draining the queue. Must not be called
    /// from inside a handler.
    pub fn flush(&self) -> usize {
        let _flushing = self.flushing.lock().expect("Mutex should not be poisoned");
        let mut delivered = 0;
        loop {
            let next = self
                .deferred
                .lock()
                .expect("Mutex should not be poisoned")
                .pop_front();
            let Some(event) = next else {
                return delivered;
            };
            self.dispatch(&event);
            delivered += 1;
        }
    }

    /// Drops queued deferred events without delivering them.
    pub fn discard_pending(&self) {
        self.deferred
            .lock()
            .expect("Mutex should not be poisoned")
            .clear();
    }

    fn dispatch(&self, event: &Event) {
        // Handlers may publish while being dispatched to, so no lock is held
        // across the calls.
        let live: Vec<Arc<dyn EventHandler>> = {
            let mut handlers = self.handlers.write().expect("RwLock should not be poisoned");
            handlers.retain(|h| h.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };
        for handler in live {
            handler.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::conversation::{CachedConversation, ConversationId};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &Event) {
            self.seen.lock().unwrap().push(event.name());
        }
    }

    fn selected() -> Event {
        Event::ConversationSelected(Some(CachedConversation::new(ConversationId::private(
            "bob",
        ))))
    }

    #[test]
    fn test_immediate_is_delivered_before_deferred_flush() {
        let bus = CoreEventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.add_handler(recorder.clone());

        bus.publish(Event::ConversationListReset(vec![]), Delivery::Deferred);
        bus.publish(selected(), Delivery::Immediate);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["conversation_selected"]);
        assert_eq!(bus.pending(), 1);

        assert_eq!(bus.flush(), 1);
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["conversation_selected", "conversation_list_reset"]
        );
    }

    #[test]
    fn test_deferred_events_keep_publish_order() {
        let bus = CoreEventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.add_handler(recorder.clone());

        bus.publish(Event::ConversationRemoved(vec![]), Delivery::Deferred);
        bus.publish(Event::ConversationStatusChanged(vec![]), Delivery::Deferred);
        bus.publish(Event::ConversationOrderChanged(vec![]), Delivery::Deferred);
        bus.flush();

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                "conversation_removed",
                "conversation_status_changed",
                "conversation_order_changed"
            ]
        );
    }

    #[derive(Default)]
    struct TargetRecorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventHandler for TargetRecorder {
        fn handle_event(&self, event: &Event) {
            if let Event::ConversationRemoved(removed) = event {
                std::thread::yield_now();
                self.seen
                    .lock()
                    .unwrap()
                    .extend(removed.iter().map(|c| c.id.target_id.clone()));
            }
        }
    }

    #[test]
    fn test_concurrent_flushes_keep_publish_order() {
        let bus = Arc::new(CoreEventBus::new());
        let recorder = Arc::new(TargetRecorder::default());
        bus.add_handler(recorder.clone());

        let expected: Vec<String> = (0..200).map(|i| format!("c{i}")).collect();
        for target in &expected {
            let removed = CachedConversation::new(ConversationId::private(target.as_str()));
            bus.publish(Event::ConversationRemoved(vec![removed]), Delivery::Deferred);
        }

        let flushers: Vec<_> = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || bus.flush())
            })
            .collect();
        let delivered: usize = flushers.into_iter().map(|t| t.join().unwrap()).sum();

        assert_eq!(delivered, 200);
        assert_eq!(*recorder.seen.lock().unwrap(), expected);
    }

    #[test]
    fn test_dropped_handler_is_pruned() {
        let bus = CoreEventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.add_handler(recorder.clone());
        assert!(bus.has_handlers());
        drop(recorder);
        assert!(!bus.has_handlers());
        bus.publish(selected(), Delivery::Immediate);
    }

    #[test]
    fn test_waker_fires_on_deferred_publish() {
        let bus = CoreEventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        bus.set_waker(move || *counter.lock().unwrap() += 1);

        bus.publish(selected(), Delivery::Immediate);
        bus.publish(selected(), Delivery::Deferred);
        assert_eq!(*hits.lock().unwrap(), 1);
        bus.discard_pending();
        assert_eq!(bus.pending(), 0);
    }
}
