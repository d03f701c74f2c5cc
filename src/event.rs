//! Per-node event channels.
//!
//! Each registered node owns two channels: one fired after a recomputation
//! and one fired after an external value assignment. Delivery is synchronous
//! and in subscription order. A panicking subscriber is caught and logged;
//! later subscribers still run and the cache write that triggered the event
//! is never rolled back.

use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tracing::error;

/// Handle for removing a subscriber from its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Callback<T> = Box<dyn FnMut(&T)>;

struct ChannelInner<T> {
    /// Slot is `None` only while its callback is executing.
    subscribers: Vec<(SubscriberId, Option<Callback<T>>)>,
    next_id: u64,
}

/// An ordered list of subscriber callbacks.
pub struct EventChannel<T> {
    inner: Rc<RefCell<ChannelInner<T>>>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        EventChannel {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventChannel<T> {
    pub fn new() -> Self {
        EventChannel {
            inner: Rc::new(RefCell::new(ChannelInner {
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    pub fn subscribe(&self, callback: impl FnMut(&T) + 'static) -> SubscriberId {
        let mut inner = self.inner.borrow_mut();
        let id = SubscriberId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, Some(Box::new(callback))));
        id
    }

    /// Removes a subscriber. Returns whether it was present.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.subscribers.iter().position(|(sid, _)| *sid == id) {
            Some(pos) => {
                inner.subscribers.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().subscribers.is_empty()
    }

    /// Delivers `value` to every subscriber in subscription order.
    ///
    /// The channel borrow is released around each callback, so subscribers
    /// may subscribe, unsubscribe, or re-enter the engine. A callback
    /// removed mid-emission is simply dropped when it returns.
    pub(crate) fn emit(&self, value: &T) {
        let mut i = 0;
        loop {
            let taken = {
                let mut inner = self.inner.borrow_mut();
                if i >= inner.subscribers.len() {
                    break;
                }
                let (id, slot) = &mut inner.subscribers[i];
                let id = *id;
                slot.take().map(|cb| (id, cb))
            };
            if let Some((id, mut callback)) = taken {
                let outcome = catch_unwind(AssertUnwindSafe(|| callback(value)));
                if let Err(payload) = outcome {
                    error!(
                        target: "calcgraph",
                        "observer {id:?} panicked: {}",
                        panic_message(&payload)
                    );
                }
                let mut inner = self.inner.borrow_mut();
                if let Some((_, slot)) = inner.subscribers.iter_mut().find(|(sid, _)| *sid == id) {
                    *slot = Some(callback);
                }
            }
            i += 1;
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn subscribers_fire_in_subscription_order() {
        let channel: EventChannel<i64> = EventChannel::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["s1", "s2", "s3"] {
            let seen = Rc::clone(&seen);
            channel.subscribe(move |v: &i64| seen.borrow_mut().push((tag, *v)));
        }

        channel.emit(&7);
        assert_eq!(*seen.borrow(), vec![("s1", 7), ("s2", 7), ("s3", 7)]);
    }

    #[test]
    fn unsubscribe_removes_exactly_one_subscriber() {
        let channel: EventChannel<i64> = EventChannel::new();
        let count = Rc::new(Cell::new(0));

        let c1 = Rc::clone(&count);
        let id = channel.subscribe(move |_| c1.set(c1.get() + 1));
        let c2 = Rc::clone(&count);
        channel.subscribe(move |_| c2.set(c2.get() + 10));

        assert!(channel.unsubscribe(id));
        assert!(!channel.unsubscribe(id));
        channel.emit(&0);
        assert_eq!(count.get(), 10);
    }

    #[test]
    fn panicking_subscriber_does_not_abort_the_rest() {
        let channel: EventChannel<i64> = EventChannel::new();
        let count = Rc::new(Cell::new(0));

        channel.subscribe(|_| panic!("boom"));
        let c = Rc::clone(&count);
        channel.subscribe(move |_| c.set(c.get() + 1));

        channel.emit(&1);
        channel.emit(&2);
        assert_eq!(count.get(), 2);
        assert_eq!(channel.len(), 2);
    }

    #[test]
    fn subscribing_during_emission_is_allowed() {
        let channel: EventChannel<i64> = EventChannel::new();
        let count = Rc::new(Cell::new(0));

        let chan = channel.clone();
        let c = Rc::clone(&count);
        channel.subscribe(move |_| {
            let c2 = Rc::clone(&c);
            chan.subscribe(move |_| c2.set(c2.get() + 1));
        });

        channel.emit(&0);
        // One subscriber added during the first emission; it saw that
        // emission and will see the next one too.
        channel.emit(&0);
        assert_eq!(count.get(), 3);
    }
}
