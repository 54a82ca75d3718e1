//! Room registry.
//!
//! The registry owns every room and its window controller, creates rooms on
//! first subscription and drops them once nobody is listening. It is owned
//! by a single reactor and never shared across threads.

use crate::id::SubscriberId;
use crate::plan::DispatchPlan;
use crate::room::{validate_room_name, Room, RoomId};
use crate::window::{WindowConfig, WindowController};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached")]
    MaxRoomsReached,

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Payload exceeds the configured limit.
    #[error("Payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single subscriber may join.
    pub max_rooms_per_subscriber: usize,
    /// Maximum size of one published payload.
    pub max_payload_size: usize,
    /// Whether to drop rooms once their last subscriber leaves.
    pub auto_delete_empty_rooms: bool,
    /// Window settings applied to every room.
    pub window: WindowConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_rooms_per_subscriber: 100,
            max_payload_size: 64 * 1024,
            auto_delete_empty_rooms: true,
            window: WindowConfig::default(),
        }
    }
}

/// Room entry with its window controller.
#[derive(Debug)]
struct RoomEntry {
    room: Room,
    window: WindowController,
}

impl RoomEntry {
    fn new(name: impl Into<RoomId>, window: WindowConfig) -> Self {
        Self {
            room: Room::new(name),
            window: WindowController::with_config(window),
        }
    }
}

/// All rooms served by one reactor.
#[derive(Debug)]
pub struct RoomRegistry {
    /// Rooms by name, ordered so flushes come out deterministically.
    rooms: BTreeMap<RoomId, RoomEntry>,
    /// Rooms each subscriber has joined.
    memberships: HashMap<SubscriberId, HashSet<RoomId>>,
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: BTreeMap::new(),
            memberships: HashMap::new(),
            config,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            subscriber_count: self.memberships.len(),
            total_subscriptions: self.memberships.values().map(HashSet::len).sum(),
            batching_rooms: self
                .rooms
                .values()
                .filter(|e| e.room.pending_count() > 0)
                .count(),
        }
    }

    /// Subscribe an id to a room, creating the room if needed.
    ///
    /// Returns `true` if the membership is new. Subscribing to a room
    /// already joined is a no-op returning `false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid or limits are exceeded.
    pub fn subscribe(&mut self, id: SubscriberId, room_name: &str) -> Result<bool, RegistryError> {
        validate_room_name(room_name).map_err(RegistryError::InvalidRoom)?;

        let joined = self.memberships.get(&id);
        if joined.is_some_and(|rooms| rooms.contains(room_name)) {
            return Ok(false);
        }
        if joined.map_or(0, HashSet::len) >= self.config.max_rooms_per_subscriber {
            return Err(RegistryError::MaxSubscriptionsReached);
        }
        if !self.rooms.contains_key(room_name) && self.rooms.len() >= self.config.max_rooms {
            return Err(RegistryError::MaxRoomsReached);
        }

        let window = self.config.window.clone();
        let entry = self
            .rooms
            .entry(room_name.to_string())
            .or_insert_with(|| {
                debug!(room = %room_name, "Creating new room");
                RoomEntry::new(room_name, window)
            });
        entry.room.subscribe(id);

        self.memberships
            .entry(id)
            .or_default()
            .insert(room_name.to_string());

        debug!(
            room = %room_name,
            subscriber = %id,
            subscribers = entry.room.subscriber_count(),
            "Subscribed"
        );

        Ok(true)
    }

    /// Unsubscribe an id from a room.
    ///
    /// Returns `true` if it was subscribed. Unknown ids and rooms are
    /// tolerated.
    pub fn unsubscribe(&mut self, id: SubscriberId, room_name: &str) -> bool {
        let Some(joined) = self.memberships.get_mut(&id) else {
            return false;
        };
        if !joined.remove(room_name) {
            return false;
        }
        if joined.is_empty() {
            self.memberships.remove(&id);
        }

        self.leave_room(id, room_name);
        true
    }

    /// Unsubscribe an id from every room it joined.
    pub fn unsubscribe_all(&mut self, id: SubscriberId) {
        if let Some(joined) = self.memberships.remove(&id) {
            for room_name in &joined {
                self.leave_room(id, room_name);
            }
        }

        debug!(subscriber = %id, "Unsubscribed from all rooms");
    }

    fn leave_room(&mut self, id: SubscriberId, room_name: &str) {
        let Some(entry) = self.rooms.get_mut(room_name) else {
            return;
        };
        entry.room.unsubscribe(id);

        debug!(
            room = %room_name,
            subscriber = %id,
            subscribers = entry.room.subscriber_count(),
            "Unsubscribed"
        );

        if self.config.auto_delete_empty_rooms && entry.room.is_empty() {
            self.rooms.remove(room_name);
            debug!(room = %room_name, "Deleted empty room");
        }
    }

    /// Publish a payload into a room's current window.
    ///
    /// The sender does not need to be subscribed to the room. Empty payloads
    /// are accepted and dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the room does not exist or the payload is too large.
    pub fn publish(
        &mut self,
        sender: SubscriberId,
        room_name: &str,
        payload: &[u8],
    ) -> Result<(), RegistryError> {
        if payload.len() > self.config.max_payload_size {
            return Err(RegistryError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let Some(entry) = self.rooms.get_mut(room_name) else {
            warn!(room = %room_name, sender = %sender, "Publish to non-existent room");
            return Err(RegistryError::RoomNotFound(room_name.to_string()));
        };

        if payload.is_empty() {
            trace!(room = %room_name, sender = %sender, "Dropped empty publication");
            return Ok(());
        }

        entry.room.publish(sender, payload);
        Ok(())
    }

    /// Pass hook: the reactor is about to block.
    ///
    /// Returns the shortest forced wakeup armed by any open window.
    pub fn on_before_wait(&mut self) -> Option<Duration> {
        self.rooms
            .values_mut()
            .filter_map(|entry| entry.window.on_before_wait(&mut entry.room))
            .min()
    }

    /// Pass hook: all ready I/O has been handled.
    ///
    /// Returns the plans of every window that closed, in room name order.
    pub fn on_after_ready(&mut self) -> Vec<DispatchPlan> {
        self.rooms
            .values_mut()
            .filter_map(|entry| entry.window.on_after_ready(&mut entry.room))
            .filter(|plan| !plan.is_empty())
            .collect()
    }

    /// Close every window holding publications, regardless of activity.
    pub fn flush_all(&mut self) -> Vec<DispatchPlan> {
        self.rooms
            .values_mut()
            .filter(|entry| entry.room.pending_count() > 0)
            .map(|entry| entry.window.force_close(&mut entry.room))
            .filter(|plan| !plan.is_empty())
            .collect()
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_name: &str) -> bool {
        self.rooms.contains_key(room_name)
    }

    /// Get a room by name.
    #[must_use]
    pub fn room(&self, room_name: &str) -> Option<&Room> {
        self.rooms.get(room_name).map(|e| &e.room)
    }

    /// Get the subscriber count for a room.
    #[must_use]
    pub fn subscriber_count(&self, room_name: &str) -> usize {
        self.rooms
            .get(room_name)
            .map(|e| e.room.subscriber_count())
            .unwrap_or(0)
    }

    /// Get all room names in order.
    #[must_use]
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Get the rooms a subscriber has joined.
    #[must_use]
    pub fn subscriber_rooms(&self, id: SubscriberId) -> Vec<String> {
        let mut rooms: Vec<_> = self
            .memberships
            .get(&id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live rooms.
    pub room_count: usize,
    /// Number of ids with at least one subscription.
    pub subscriber_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
    /// Rooms with an open window.
    pub batching_rooms: usize,
}
