//! Position change and error notification.
//!
//! Consumers either register handlers, which run synchronously on the thread
//! that delivered the provider event, or subscribe to a broadcast stream.
//! Handlers are never invoked while the geolocator's state lock is held, so a
//! handler may call back into the geolocator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::error::GeolocationError;
use crate::position::Position;

/// Event published by a geolocator.
#[derive(Debug, Clone, PartialEq)]
pub enum GeolocatorEvent {
    /// A fix was accepted by the listening session.
    PositionChanged(Position),
    /// The listening session failed and has already been stopped.
    PositionError(GeolocationError),
}

/// Handler for accepted positions.
pub type PositionChangedHandler = Arc<dyn Fn(&Position) + Send + Sync>;

/// Handler for session failures.
pub type PositionErrorHandler = Arc<dyn Fn(GeolocationError) + Send + Sync>;

/// Registration handle returned when adding a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Handlers {
    changed: Vec<(HandlerId, PositionChangedHandler)>,
    error: Vec<(HandlerId, PositionErrorHandler)>,
}

pub(crate) struct EventHub {
    handlers: Mutex<Handlers>,
    next_id: AtomicU64,
    tx: broadcast::Sender<GeolocatorEvent>,
}

impl EventHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            handlers: Mutex::new(Handlers::default()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add_position_changed(&self, handler: PositionChangedHandler) -> HandlerId {
        let id = self.next_id();
        self.handlers().changed.push((id, handler));
        id
    }

    pub(crate) fn add_position_error(&self, handler: PositionErrorHandler) -> HandlerId {
        let id = self.next_id();
        self.handlers().error.push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers();
        let before = handlers.changed.len() + handlers.error.len();
        handlers.changed.retain(|(h, _)| *h != id);
        handlers.error.retain(|(h, _)| *h != id);
        before != handlers.changed.len() + handlers.error.len()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<GeolocatorEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish_position_changed(&self, position: &Position) {
        let snapshot: Vec<PositionChangedHandler> = self
            .handlers()
            .changed
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(position);
        }
        // No receivers is not an error.
        let _ = self.tx.send(GeolocatorEvent::PositionChanged(position.clone()));
    }

    pub(crate) fn publish_position_error(&self, error: GeolocationError) {
        let snapshot: Vec<PositionErrorHandler> = self
            .handlers()
            .error
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(error);
        }
        let _ = self.tx.send(GeolocatorEvent::PositionError(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_run_in_registration_order() {
        let hub = EventHub::new(8);
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            hub.add_position_changed(Arc::new(move |_| order.lock().unwrap().push(n)));
        }
        hub.publish_position_changed(&Position::now(1.0, 2.0));

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_removed_handler_is_not_called() {
        let hub = EventHub::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = hub.add_position_error(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(hub.remove(id));
        assert!(!hub.remove(id));
        hub.publish_position_error(GeolocationError::Unauthorized);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_broadcast_receives_events() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();

        hub.publish_position_error(GeolocationError::PositionUnavailable);

        assert_eq!(
            rx.try_recv().unwrap(),
            GeolocatorEvent::PositionError(GeolocationError::PositionUnavailable)
        );
    }

    #[test]
    fn test_publish_without_receivers_is_silent() {
        let hub = EventHub::new(1);
        hub.publish_position_changed(&Position::now(0.0, 0.0));
    }
}
