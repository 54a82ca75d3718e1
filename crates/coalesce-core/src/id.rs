//! Stable subscriber identities.
//!
//! Connections are addressed by a [`SubscriberId`]: a slot index into an
//! [`IdArena`] plus the generation of that slot. Reusing a slot bumps its
//! generation, so an id held by a departed connection never resolves to the
//! connection that replaced it.

use std::fmt;

/// Identity of a connected recipient.
///
/// The total order is `(index, generation)`. It carries no meaning beyond
/// being stable for the lifetime of the connection, which is what the
/// dispatch planner's merge-join relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId {
    index: u32,
    generation: u32,
}

impl SubscriberId {
    /// Create an id from raw parts.
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Generation-checked slot arena.
///
/// Owns one value per live connection (typically its outbound queue).
#[derive(Debug)]
pub struct IdArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> IdArena<T> {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value, returning its id.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` slots are ever allocated.
    pub fn insert(&mut self, value: T) -> SubscriberId {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => generation.wrapping_add(1),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            return SubscriberId::new(index, generation);
        }

        assert!(
            self.slots.len() < u32::MAX as usize,
            "arena exceeds u32::MAX slots"
        );
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        SubscriberId::new(index, 0)
    }

    /// Remove the value for `id`.
    ///
    /// Returns `None` if the id is stale or was never issued.
    pub fn remove(&mut self, id: SubscriberId) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }

        let vacated = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: id.generation,
            },
        );
        self.free.push(id.index);
        self.len -= 1;

        match vacated {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Get the value for `id`.
    #[must_use]
    pub fn get(&self, id: SubscriberId) -> Option<&T> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Get the value for `id` mutably.
    pub fn get_mut(&mut self, id: SubscriberId) -> Option<&mut T> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    /// Check whether `id` refers to a live value.
    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the arena holds no live values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live values in id order.
    pub fn iter(&self) -> impl Iterator<Item = (SubscriberId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((SubscriberId::new(index as u32, *generation), value))
                }
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Default for IdArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
