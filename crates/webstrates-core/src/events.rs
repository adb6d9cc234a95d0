//! Named-event bus with per-subscription filter pipelines.
//!
//! Every registration may carry a filter that reshapes the payload for that
//! handler alone. The trigger side decides what happens after filtering
//! through [`TriggerOptions`]: the document session, for example, passes
//! the raw tree as payload and renders it to HTML in both branches.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Event handler. Identity (for unregistering) is the `Rc` allocation.
pub type Handler<P> = Rc<dyn Fn(P)>;

/// Subscription filter.
///
/// Receives the payload by mutable reference; the payload is shared by all
/// filters of one delivery and is not cloned between them.
pub type Filter<P> = Rc<dyn Fn(&mut P) -> P>;

/// Options supplied when registering a handler.
pub struct SubscribeOptions<P> {
    /// Filter applied to the payload before it reaches the handler
    pub filter: Option<Filter<P>>,
}

impl<P> SubscribeOptions<P> {
    /// Options with the given filter.
    #[must_use]
    pub fn filtered(filter: impl Fn(&mut P) -> P + 'static) -> Self {
        Self {
            filter: Some(Rc::new(filter)),
        }
    }
}

impl<P> Default for SubscribeOptions<P> {
    fn default() -> Self {
        Self { filter: None }
    }
}

/// Options supplied when triggering an event.
pub struct TriggerOptions<'a, P> {
    /// Applied to the filter result for handlers registered with a filter
    pub on_filtered: Option<&'a dyn Fn(P) -> P>,
    /// Applied to the payload for handlers registered without a filter
    pub on_not_filtered: Option<&'a dyn Fn(&P) -> P>,
}

impl<P> Default for TriggerOptions<'_, P> {
    fn default() -> Self {
        Self {
            on_filtered: None,
            on_not_filtered: None,
        }
    }
}

struct Registration<P> {
    handler: Handler<P>,
    filter: Option<Filter<P>>,
}

impl<P> Clone for Registration<P> {
    fn clone(&self) -> Self {
        Self {
            handler: Rc::clone(&self.handler),
            filter: self.filter.clone(),
        }
    }
}

struct Registry<P> {
    allowed_events: Option<Vec<String>>,
    registrations: RefCell<HashMap<String, Vec<Registration<P>>>>,
}

impl<P> Registry<P> {
    fn remove(&self, event_name: &str, handler: &Handler<P>) -> Result<(), EventError> {
        let mut registrations = self.registrations.borrow_mut();
        let list = registrations
            .get_mut(event_name)
            .ok_or_else(|| EventError::HandlerNotRegistered(event_name.to_string()))?;
        let index = list
            .iter()
            .position(|registration| Rc::ptr_eq(&registration.handler, handler))
            .ok_or_else(|| EventError::HandlerNotRegistered(event_name.to_string()))?;
        list.remove(index);
        if list.is_empty() {
            registrations.remove(event_name);
        }
        Ok(())
    }
}

/// Named-event bus.
///
/// Cloning yields another handle to the same registrations.
pub struct EventBus<P> {
    registry: Rc<Registry<P>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        Self {
            registry: Rc::clone(&self.registry),
        }
    }
}

impl<P> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for EventBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registrations = self.registry.registrations.borrow();
        let mut names: Vec<_> = registrations.keys().collect();
        names.sort();
        f.debug_struct("EventBus")
            .field("allowed_events", &self.registry.allowed_events)
            .field("events", &names)
            .finish()
    }
}

impl<P> EventBus<P> {
    /// Create a bus accepting any event name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Rc::new(Registry {
                allowed_events: None,
                registrations: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Create a bus accepting only the given event names.
    #[must_use]
    pub fn with_allowed_events<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            registry: Rc::new(Registry {
                allowed_events: Some(names.into_iter().map(Into::into).collect()),
                registrations: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Register a handler under an event name.
    ///
    /// # Errors
    ///
    /// Returns error if an allow-list is configured and does not contain
    /// `event_name`.
    pub fn register(
        &self,
        event_name: &str,
        handler: Handler<P>,
        options: SubscribeOptions<P>,
    ) -> Result<Subscription<P>, EventError> {
        if let Some(allowed) = &self.registry.allowed_events {
            if !allowed.iter().any(|name| name == event_name) {
                return Err(EventError::NotAllowed(event_name.to_string()));
            }
        }

        self.registry
            .registrations
            .borrow_mut()
            .entry(event_name.to_string())
            .or_default()
            .push(Registration {
                handler: Rc::clone(&handler),
                filter: options.filter,
            });

        Ok(Subscription {
            registry: Rc::downgrade(&self.registry),
            event_name: event_name.to_string(),
            handler,
        })
    }

    /// Remove the first registration of `handler` under `event_name`.
    ///
    /// # Errors
    ///
    /// Returns error if the handler is not registered under that name.
    pub fn unregister(&self, event_name: &str, handler: &Handler<P>) -> Result<(), EventError> {
        self.registry.remove(event_name, handler)
    }

    /// Whether any handler is registered under `event_name`.
    #[must_use]
    pub fn has_subscribers(&self, event_name: &str) -> bool {
        self.registry
            .registrations
            .borrow()
            .get(event_name)
            .is_some_and(|list| !list.is_empty())
    }

    /// Deliver `payload` to every handler registered under `event_name`,
    /// in registration order.
    ///
    /// Handlers registered during the delivery are not invoked by it.
    /// Panics raised by handlers or filters propagate to the caller.
    pub fn trigger(&self, event_name: &str, mut payload: P, options: &TriggerOptions<'_, P>)
    where
        P: Clone,
    {
        let snapshot = self.registry.registrations.borrow().get(event_name).cloned();
        let Some(snapshot) = snapshot else {
            return;
        };

        for registration in snapshot {
            let value = match &registration.filter {
                Some(filter) => {
                    let filtered = filter(&mut payload);
                    match options.on_filtered {
                        Some(on_filtered) => on_filtered(filtered),
                        None => filtered,
                    }
                }
                None => match options.on_not_filtered {
                    Some(on_not_filtered) => on_not_filtered(&payload),
                    None => payload.clone(),
                },
            };
            (registration.handler)(value);
        }
    }
}

/// Handle to one registration.
///
/// Dropping it leaves the handler registered; call [`Subscription::dispose`]
/// to remove it.
pub struct Subscription<P> {
    registry: Weak<Registry<P>>,
    event_name: String,
    handler: Handler<P>,
}

impl<P> Subscription<P> {
    /// Event name the handler is registered under.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// Unregister the handler.
    ///
    /// # Errors
    ///
    /// Returns error if the handler was already removed or the bus is gone.
    pub fn dispose(&self) -> Result<(), EventError> {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(&self.event_name, &self.handler),
            None => Err(EventError::HandlerNotRegistered(self.event_name.clone())),
        }
    }
}

impl<P> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event_name", &self.event_name)
            .finish_non_exhaustive()
    }
}

/// Event bus misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Event name is not on the allow-list
    #[error("event '{0}' is not allowed")]
    NotAllowed(String),
    /// No such handler registered under the event name
    #[error("handler not registered for event '{0}'")]
    HandlerNotRegistered(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder<P: 'static>() -> (Handler<P>, Rc<RefCell<Vec<P>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let handler: Handler<P> = Rc::new(move |payload: P| sink.borrow_mut().push(payload));
        (handler, seen)
    }

    #[test]
    fn register_and_unregister() {
        let bus = EventBus::<String>::new();
        let (handler, _) = recorder();

        bus.register("test", Rc::clone(&handler), SubscribeOptions::default())
            .unwrap();
        assert!(bus.has_subscribers("test"));

        bus.unregister("test", &handler).unwrap();
        assert!(!bus.has_subscribers("test"));
    }

    #[test]
    fn unregister_unknown_handler_fails() {
        let bus = EventBus::<String>::new();
        let (handler, _) = recorder();
        assert_eq!(
            bus.unregister("test", &handler),
            Err(EventError::HandlerNotRegistered("test".into()))
        );
    }

    #[test]
    fn unregister_removes_first_match_only() {
        let bus = EventBus::<u32>::new();
        let (handler, seen) = recorder();
        bus.register("n", Rc::clone(&handler), SubscribeOptions::default())
            .unwrap();
        bus.register("n", Rc::clone(&handler), SubscribeOptions::default())
            .unwrap();

        bus.unregister("n", &handler).unwrap();
        bus.trigger("n", 7, &TriggerOptions::default());
        assert_eq!(*seen.borrow(), vec![7]);
    }

    #[test]
    fn dispose_twice_fails() {
        let bus = EventBus::<u32>::new();
        let (handler, _) = recorder();
        let subscription = bus
            .register("n", handler, SubscribeOptions::default())
            .unwrap();

        subscription.dispose().unwrap();
        assert!(matches!(
            subscription.dispose(),
            Err(EventError::HandlerNotRegistered(_))
        ));
    }

    #[test]
    fn allow_list_is_enforced() {
        let bus = EventBus::<u32>::with_allowed_events(["allowed", "also-allowed"]);
        let (handler, _) = recorder();

        assert!(bus
            .register("allowed", Rc::clone(&handler), SubscribeOptions::default())
            .is_ok());
        assert_eq!(
            bus.register("not-allowed", Rc::clone(&handler), SubscribeOptions::default())
                .unwrap_err(),
            EventError::NotAllowed("not-allowed".into())
        );
        assert!(bus
            .register("also-allowed", handler, SubscribeOptions::default())
            .is_ok());
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let bus = EventBus::<u32>::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = Rc::clone(&order);
            bus.register(
                "n",
                Rc::new(move |_: u32| order.borrow_mut().push(tag)),
                SubscribeOptions::default(),
            )
            .unwrap();
        }
        bus.trigger("n", 1, &TriggerOptions::default());
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn filter_pipeline() {
        let bus = EventBus::<String>::new();
        let (filtered_handler, filtered_seen) = recorder();
        let (plain_handler, plain_seen) = recorder();

        bus.register(
            "test",
            filtered_handler,
            SubscribeOptions::filtered(|payload: &mut String| payload.replace("world", "")),
        )
        .unwrap();
        bus.register("test", plain_handler, SubscribeOptions::default())
            .unwrap();

        let on_filtered = |value: String| format!("{value}+filtered");
        let on_not_filtered = |value: &String| format!("{value}+plain");
        bus.trigger(
            "test",
            "hello world".to_string(),
            &TriggerOptions {
                on_filtered: Some(&on_filtered),
                on_not_filtered: Some(&on_not_filtered),
            },
        );

        assert_eq!(*filtered_seen.borrow(), vec!["hello +filtered".to_string()]);
        assert_eq!(*plain_seen.borrow(), vec!["hello world+plain".to_string()]);
    }

    #[test]
    fn filters_share_the_payload() {
        let bus = EventBus::<Vec<u32>>::new();
        let (first, _) = recorder();
        let (second, second_seen) = recorder();

        let push = |payload: &mut Vec<u32>| {
            payload.push(1);
            payload.clone()
        };
        bus.register("n", first, SubscribeOptions::filtered(push))
            .unwrap();
        bus.register("n", second, SubscribeOptions::filtered(push))
            .unwrap();

        bus.trigger("n", Vec::new(), &TriggerOptions::default());
        assert_eq!(*second_seen.borrow(), vec![vec![1, 1]]);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = EventBus::<u32>::new();
        let late_calls = Rc::new(Cell::new(0));

        let reentrant_bus = bus.clone();
        let counter = Rc::clone(&late_calls);
        bus.register(
            "n",
            Rc::new(move |_: u32| {
                let counter = Rc::clone(&counter);
                reentrant_bus
                    .register(
                        "n",
                        Rc::new(move |_: u32| counter.set(counter.get() + 1)),
                        SubscribeOptions::default(),
                    )
                    .unwrap();
            }),
            SubscribeOptions::default(),
        )
        .unwrap();

        bus.trigger("n", 1, &TriggerOptions::default());
        assert_eq!(late_calls.get(), 0);

        bus.trigger("n", 2, &TriggerOptions::default());
        assert_eq!(late_calls.get(), 1);
    }
}
