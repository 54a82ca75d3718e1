//! Coalescing buffer for one broadcast domain.
//!
//! A room appends every publication of the current window to one shared
//! buffer and remembers which byte ranges each sender contributed. Flushing
//! turns the window into a [`DispatchPlan`] and resets it; the subscriber
//! set survives flushes.

use crate::gap::Gap;
use crate::id::SubscriberId;
use crate::plan::{self, DispatchPlan};
use bytes::BytesMut;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// One broadcast domain.
#[derive(Debug)]
pub struct Room {
    name: RoomId,
    /// Concatenation of every payload published in the current window.
    shared: BytesMut,
    /// Ranges of `shared` contributed by each sender, in publish order.
    exclusions: BTreeMap<SubscriberId, Vec<Gap>>,
    subscribers: BTreeSet<SubscriberId>,
    pending: usize,
    received_this_pass: bool,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(name: impl Into<RoomId>) -> Self {
        Self {
            name: name.into(),
            shared: BytesMut::new(),
            exclusions: BTreeMap::new(),
            subscribers: BTreeSet::new(),
            pending: 0,
            received_this_pass: false,
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if an id is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.subscribers.contains(&id)
    }

    /// Subscribers in id order.
    pub fn subscribers(&self) -> impl Iterator<Item = SubscriberId> + '_ {
        self.subscribers.iter().copied()
    }

    /// Check if the room has no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Publications accumulated since the last flush.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending
    }

    /// Bytes accumulated since the last flush.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.shared.len()
    }

    /// Whether a publication arrived during the current pass.
    #[must_use]
    pub fn received_this_pass(&self) -> bool {
        self.received_this_pass
    }

    /// Ranges recorded for a sender in the current window.
    #[must_use]
    pub fn exclusions_for(&self, sender: SubscriberId) -> &[Gap] {
        self.exclusions
            .get(&sender)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of distinct senders in the current window.
    #[must_use]
    pub fn sender_count(&self) -> usize {
        self.exclusions.len()
    }

    /// Add a subscriber.
    ///
    /// Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, id: SubscriberId) -> bool {
        let added = self.subscribers.insert(id);
        if added {
            debug!(room = %self.name, subscriber = %id, "Subscriber added");
        }
        added
    }

    /// Remove a subscriber.
    ///
    /// Returns `true` if it was subscribed. Ranges it published in the
    /// current window stay in the buffer and are simply never planned for it.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id);
        if removed {
            debug!(room = %self.name, subscriber = %id, "Subscriber removed");
        }
        removed
    }

    /// Append a publication to the current window.
    ///
    /// The sender does not have to be subscribed.
    pub fn publish(&mut self, sender: SubscriberId, payload: &[u8]) {
        let range = Gap::new(self.shared.len(), payload.len());
        self.shared.extend_from_slice(payload);
        self.exclusions.entry(sender).or_default().push(range);

        self.pending += 1;
        self.received_this_pass = true;

        trace!(
            room = %self.name,
            sender = %sender,
            bytes = payload.len(),
            pending = self.pending,
            "Publication buffered"
        );
    }

    /// Start a new event-loop pass.
    pub fn begin_pass(&mut self) {
        self.received_this_pass = false;
    }

    /// Close the current window.
    ///
    /// Returns the sends for every subscriber and clears the buffer and the
    /// exclusion index. An empty window yields an empty plan.
    pub fn flush(&mut self) -> DispatchPlan {
        if self.pending == 0 {
            return DispatchPlan::empty(self.name.clone());
        }

        let buffer = self.shared.split().freeze();
        let exclusions = std::mem::take(&mut self.exclusions);
        let publications = std::mem::replace(&mut self.pending, 0);

        let plan = plan::plan(
            &self.name,
            buffer,
            publications,
            &self.subscribers,
            &exclusions,
        );

        trace!(
            room = %self.name,
            publications,
            bytes = plan.stats().buffer_len,
            sends = plan.len(),
            "Window flushed"
        );

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Action;
    use bytes::Bytes;

    fn id(index: u32) -> SubscriberId {
        SubscriberId::new(index, 0)
    }

    #[test]
    fn test_room_creation() {
        let room = Room::new("test:room");
        assert_eq!(room.name(), "test:room");
        assert_eq!(room.subscriber_count(), 0);
        assert!(room.is_empty());
        assert_eq!(room.pending_count(), 0);
    }

    #[test]
    fn test_room_subscribe_unsubscribe() {
        let mut room = Room::new("test");

        assert!(room.subscribe(id(1)));
        assert!(!room.subscribe(id(1)));
        assert!(room.subscribe(id(0)));
        assert_eq!(room.subscriber_count(), 2);

        let order: Vec<_> = room.subscribers().collect();
        assert_eq!(order, vec![id(0), id(1)]);

        assert!(room.unsubscribe(id(1)));
        assert!(!room.unsubscribe(id(1)));
        assert!(!room.unsubscribe(id(7)));
        assert_eq!(room.subscriber_count(), 1);
    }

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("valid:room").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("$system").is_err());
        assert!(validate_room_name("tab\there").is_err());

        let long_name = "a".repeat(MAX_ROOM_NAME_LENGTH + 1);
        assert!(validate_room_name(&long_name).is_err());
    }

    #[test]
    fn test_publish_records_ranges() {
        let mut room = Room::new("test");
        room.publish(id(0), b"hello");
        room.publish(id(1), b"world");
        room.publish(id(0), b"!");

        assert_eq!(room.pending_count(), 3);
        assert_eq!(room.buffered_bytes(), 11);
        assert_eq!(room.sender_count(), 2);
        assert_eq!(
            room.exclusions_for(id(0)),
            &[Gap::new(0, 5), Gap::new(10, 1)]
        );
        assert_eq!(room.exclusions_for(id(1)), &[Gap::new(5, 5)]);
        assert!(room.exclusions_for(id(2)).is_empty());
        assert!(room.received_this_pass());

        room.begin_pass();
        assert!(!room.received_this_pass());
    }

    #[test]
    fn test_flush_hello_world() {
        let (a, b, c) = (id(0), id(1), id(2));
        let mut room = Room::new("test");
        room.subscribe(a);
        room.subscribe(b);
        room.subscribe(c);

        room.publish(a, b"hello");
        room.publish(b, b"world");

        let plan = room.flush();
        assert_eq!(plan.action_for(a), Some(&Action::SendBytes(Bytes::from_static(b"world"))));
        assert_eq!(plan.action_for(b), Some(&Action::SendBytes(Bytes::from_static(b"hello"))));
        assert_eq!(
            plan.action_for(c),
            Some(&Action::SendVerbatim(Bytes::from_static(b"helloworld")))
        );
    }

    #[test]
    fn test_flush_resets_window_only() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        room.subscribe(id(1));
        room.publish(id(0), b"x");

        let _ = room.flush();

        assert_eq!(room.pending_count(), 0);
        assert_eq!(room.buffered_bytes(), 0);
        assert_eq!(room.sender_count(), 0);
        assert_eq!(room.subscriber_count(), 2);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        let plan = room.flush();
        assert!(plan.is_empty());
        assert_eq!(plan.room(), "test");
    }

    #[test]
    fn test_consecutive_windows_do_not_leak() {
        let a = id(0);
        let listener = id(1);
        let mut room = Room::new("test");
        room.subscribe(a);
        room.subscribe(listener);

        room.publish(a, b"x");
        let first = room.flush();
        assert_eq!(&first.action_for(listener).unwrap().payload()[..], b"x");
        assert!(first.action_for(a).is_none());

        room.publish(a, b"y");
        let second = room.flush();
        assert_eq!(&second.action_for(listener).unwrap().payload()[..], b"y");
        assert!(second.action_for(a).is_none());
    }

    #[test]
    fn test_unsubscribed_sender_ranges_discarded() {
        let mut room = Room::new("test");
        room.subscribe(id(0));
        room.subscribe(id(1));
        room.publish(id(0), b"gone");
        room.publish(id(1), b"here");
        room.unsubscribe(id(0));

        let plan = room.flush();
        assert_eq!(plan.len(), 1);
        assert_eq!(&plan.action_for(id(1)).unwrap().payload()[..], b"gone");
    }
}
