//! Event subscriptions.
//!
//! Some commands complete twice: once synchronously with `OK`, and once more
//! when the network answers with a separate unsolicited event (a USSD
//! session reply, for example). A [`Subscription`] registered together with
//! the command receives every event the engine dispatches after its own
//! handler, until it deactivates.
//!
//! The engine holds subscriptions as `Arc<dyn Subscription>` and compacts its
//! list after each dispatch, so deactivation from inside
//! [`Subscription::process`] is safe.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::event::Event;

/// A listener for unsolicited events.
pub trait Subscription: Send + Sync {
    /// Handle one event. Called only while [`Subscription::is_active`] is true.
    fn process(&self, event: &Event);

    /// Whether this subscription still wants events.
    fn is_active(&self) -> bool;

    /// Permanently deactivate this subscription.
    fn unsubscribe(&self);
}

/// Outcome of offering an event to a [`OneShot`] handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The event completed the subscription; it deactivates.
    Consumed,
    /// The event was not the awaited reply; keep listening.
    Ignored,
}

/// A subscription that waits for one event with a given name.
///
/// Events with any other name never reach the handler. The handler decides
/// whether a same-named event completes the subscription by returning
/// [`Delivery::Consumed`]; after that the handler is never called again.
pub struct OneShot<F> {
    event_name: String,
    active: AtomicBool,
    handler: Mutex<F>,
}

impl<F> OneShot<F>
where
    F: FnMut(&Event) -> Delivery + Send,
{
    /// Create a subscription for events named `event_name` (e.g. `+CUSD`).
    pub fn new(event_name: impl Into<String>, handler: F) -> Self {
        OneShot {
            event_name: event_name.into(),
            active: AtomicBool::new(true),
            handler: Mutex::new(handler),
        }
    }
}

impl<F> Subscription for OneShot<F>
where
    F: FnMut(&Event) -> Delivery + Send,
{
    fn process(&self, event: &Event) {
        if event.name() != self.event_name {
            return;
        }

        let mut handler = self.handler.lock();
        // Re-check under the lock: a concurrent unsubscribe wins.
        if !self.is_active() {
            return;
        }
        if handler(event) == Delivery::Consumed {
            self.active.store(false, Ordering::Release);
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
    }
}
