//! Keeps track of which event queues observe which elements.

use std::collections::HashMap;

use thiserror::Error;
use tracing::trace;

use crate::element::{Cookie, Element};

/// A change of an element's value, delivered to subscribed queues.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ElementEvent {
    /// The element whose value changed.
    pub cookie: Cookie,

    /// The time of the change, in nanoseconds since the creation of the
    /// owning device.
    pub timestamp: u64,

    /// The new raw value words.
    pub value: Vec<u32>,
}

/// The sending side of an event queue.
///
/// Queues are identified by their channel, so clones of a queue count as the
/// same subscriber.
#[derive(Clone, Debug)]
pub struct EventQueue {
    sender: flume::Sender<ElementEvent>,
}

impl EventQueue {
    /// Creates a bounded event queue holding at most `capacity` events.
    ///
    /// Events arriving while the queue is full are dropped.
    pub fn bounded(capacity: usize) -> (Self, flume::Receiver<ElementEvent>) {
        let (sender, receiver) = flume::bounded(capacity);
        (Self { sender }, receiver)
    }

    /// Creates an event queue without a size limit.
    pub fn unbounded() -> (Self, flume::Receiver<ElementEvent>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }

    /// Checks whether the receiving side of the queue was dropped.
    pub fn is_disconnected(&self) -> bool {
        self.sender.is_disconnected()
    }

    fn push(&self, event: ElementEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

impl PartialEq for EventQueue {
    fn eq(&self, other: &Self) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

impl Eq for EventQueue {}

/// Represents an error of a subscription call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
pub enum SubscriptionError {
    /// The cookie does not refer to a data element.
    #[error("the cookie does not refer to a data element")]
    BadArgument,
}

/// Maps data elements to the queues subscribed to them.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subscribers: HashMap<Cookie, Vec<EventQueue>>,
}

impl SubscriptionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a queue to an element. Subscribing twice has no effect.
    pub fn subscribe(&mut self, cookie: Cookie, queue: &EventQueue) {
        let queues = self.subscribers.entry(cookie).or_default();
        if !queues.contains(queue) {
            queues.push(queue.clone());
        }
    }

    /// Removes a queue from an element. Removing an absent queue has no
    /// effect.
    pub fn unsubscribe(&mut self, cookie: Cookie, queue: &EventQueue) {
        if let Some(queues) = self.subscribers.get_mut(&cookie) {
            queues.retain(|q| q != queue);
            if queues.is_empty() {
                self.subscribers.remove(&cookie);
            }
        }
    }

    /// Removes a queue from every element.
    pub fn unsubscribe_all(&mut self, queue: &EventQueue) {
        self.subscribers.retain(|_, queues| {
            queues.retain(|q| q != queue);
            !queues.is_empty()
        });
    }

    /// Checks whether a queue is subscribed to an element.
    pub fn is_subscribed(&self, cookie: Cookie, queue: &EventQueue) -> bool {
        self.subscribers
            .get(&cookie)
            .is_some_and(|queues| queues.contains(queue))
    }

    /// Returns the number of queues subscribed to an element.
    pub fn subscriber_count(&self, cookie: Cookie) -> usize {
        self.subscribers.get(&cookie).map_or(0, Vec::len)
    }

    /// Pushes the current value of an element to all of its subscribers.
    pub(crate) fn notify(&self, element: &Element) {
        let Some(queues) = self.subscribers.get(&element.cookie()) else {
            return;
        };

        let event = ElementEvent {
            cookie: element.cookie(),
            timestamp: element.timestamp(),
            value: element.raw_value().to_vec(),
        };

        for queue in queues {
            if !queue.push(event.clone()) {
                trace!(cookie = element.cookie().0, "dropped element event");
            }
        }
    }
}
