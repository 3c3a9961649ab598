//! Host event subscription.
//!
//! Hosts notify the crate about environment changes (window focus, network
//! coming back online, ...) through [`EventSource`]. Everything runs on the
//! host's thread, so handlers are not required to be `Send`.
use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

/// Something that emits named events.
pub trait EventSource {
    /// Attaches `handler` to `event` until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    fn subscribe(&self, event: &str, handler: Box<dyn Fn()>) -> Subscription;
}

/// Guard that detaches a handler when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Detaches the handler now.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

type Handler = Rc<dyn Fn()>;

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_event: HashMap<String, Vec<(u64, Handler)>>,
}

/// A simple in-process [`EventSource`].
///
/// Clones share the same handler table.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Rc<RefCell<Handlers>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invokes every handler subscribed to `event` and returns how many ran.
    ///
    /// Handlers may subscribe or unsubscribe while being invoked; such changes
    /// take effect from the next `emit`.
    pub fn emit(&self, event: &str) -> usize {
        let handlers: Vec<Handler> = self
            .handlers
            .borrow()
            .by_event
            .get(event)
            .map(|list| list.iter().map(|(_, h)| Rc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler();
        }
        handlers.len()
    }

    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.handlers
            .borrow()
            .by_event
            .get(event)
            .map_or(0, Vec::len)
    }
}

impl EventSource for EventBus {
    fn subscribe(&self, event: &str, handler: Box<dyn Fn()>) -> Subscription {
        let mut handlers = self.handlers.borrow_mut();
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers
            .by_event
            .entry(event.to_owned())
            .or_default()
            .push((id, Rc::from(handler)));
        drop(handlers);

        let table: Weak<RefCell<Handlers>> = Rc::downgrade(&self.handlers);
        let event = event.to_owned();
        Subscription::new(move || {
            let Some(table) = table.upgrade() else {
                return;
            };
            let mut handlers = table.borrow_mut();
            if let Some(list) = handlers.by_event.get_mut(&event) {
                list.retain(|(handler_id, _)| *handler_id != id);
                if list.is_empty() {
                    handlers.by_event.remove(&event);
                }
            }
        })
    }
}
