//! Dispatch planning.
//!
//! A flushed window becomes a [`DispatchPlan`]: one verbatim payload shared
//! by every pure listener, plus one reconstructed payload per subscriber
//! that also published into the window.

use crate::gap::{self, Gap};
use crate::id::SubscriberId;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// What to deliver to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver the window's shared buffer unchanged.
    ///
    /// Every verbatim action of a plan holds the same allocation, so the
    /// transport can frame it once and reuse the frame.
    SendVerbatim(Bytes),
    /// Deliver a payload reconstructed for this recipient.
    SendBytes(Bytes),
}

impl Action {
    /// The payload carried by this action.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        match self {
            Action::SendVerbatim(bytes) | Action::SendBytes(bytes) => bytes,
        }
    }

    /// Check if this is a verbatim send.
    #[must_use]
    pub fn is_verbatim(&self) -> bool {
        matches!(self, Action::SendVerbatim(_))
    }
}

/// Counters describing one flushed window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Publications coalesced into the window.
    pub publications: usize,
    /// Size of the shared buffer.
    pub buffer_len: usize,
    /// Recipients served the shared buffer.
    pub verbatim: usize,
    /// Recipients served a reconstructed payload.
    pub reconstructed: usize,
    /// Subscribed senders with nothing left to receive.
    pub suppressed: usize,
}

/// The sends produced by flushing one room.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    room: String,
    verbatim: Bytes,
    entries: Vec<(SubscriberId, Action)>,
    stats: FlushStats,
}

impl DispatchPlan {
    /// A plan with nothing to send.
    #[must_use]
    pub fn empty(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            verbatim: Bytes::new(),
            entries: Vec::new(),
            stats: FlushStats::default(),
        }
    }

    /// Name of the room this plan was flushed from.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// The window's shared buffer.
    #[must_use]
    pub fn verbatim(&self) -> &Bytes {
        &self.verbatim
    }

    /// Planned sends in subscriber order.
    #[must_use]
    pub fn entries(&self) -> &[(SubscriberId, Action)] {
        &self.entries
    }

    /// Window counters.
    #[must_use]
    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    /// Number of planned sends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the plan sends nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the action planned for one recipient.
    #[must_use]
    pub fn action_for(&self, id: SubscriberId) -> Option<&Action> {
        self.entries
            .binary_search_by(|(entry, _)| entry.cmp(&id))
            .ok()
            .map(|i| &self.entries[i].1)
    }
}

impl IntoIterator for DispatchPlan {
    type Item = (SubscriberId, Action);
    type IntoIter = std::vec::IntoIter<(SubscriberId, Action)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Build the plan for one window.
///
/// Walks `subscribers` and `exclusions` together in id order (a single
/// merge-join). A subscriber with no exclusions gets the shared buffer; a
/// subscriber that published gets the complement of its own ranges, or
/// nothing if that complement is empty. Senders that are not subscribed
/// are skipped without reconstructing anything.
#[must_use]
pub fn plan(
    room: &str,
    buffer: Bytes,
    publications: usize,
    subscribers: &BTreeSet<SubscriberId>,
    exclusions: &BTreeMap<SubscriberId, Vec<Gap>>,
) -> DispatchPlan {
    let mut entries = Vec::with_capacity(subscribers.len());
    let mut stats = FlushStats {
        publications,
        buffer_len: buffer.len(),
        ..FlushStats::default()
    };

    let mut senders = exclusions.iter().peekable();

    for &subscriber in subscribers {
        let mut excluded = None;

        while let Some(&(&sender, ranges)) = senders.peek() {
            match sender.cmp(&subscriber) {
                Ordering::Less => {
                    senders.next();
                }
                Ordering::Equal => {
                    excluded = Some(ranges);
                    senders.next();
                    break;
                }
                Ordering::Greater => break,
            }
        }

        match excluded {
            None => {
                entries.push((subscriber, Action::SendVerbatim(buffer.clone())));
                stats.verbatim += 1;
            }
            Some(ranges) => {
                let payload = gap::reconstruct(&buffer, ranges);
                if payload.is_empty() {
                    stats.suppressed += 1;
                } else {
                    entries.push((subscriber, Action::SendBytes(payload)));
                    stats.reconstructed += 1;
                }
            }
        }
    }

    DispatchPlan {
        room: room.to_string(),
        verbatim: buffer,
        entries,
        stats,
    }
}
