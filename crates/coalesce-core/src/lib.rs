//! # coalesce-core
//!
//! Broadcast coalescing engine for publish/subscribe fan-out.
//!
//! Publications that arrive within one batching window are merged into a
//! single shared buffer. On flush, every pure listener receives that buffer
//! verbatim, and every subscriber that also published receives the buffer
//! with its own contributions cut out. N publications to M subscribers cost
//! one shared serialization plus at most one reconstruction per distinct
//! sender, instead of N×M sends.
//!
//! - **Gap** - Byte-range exclusion codec
//! - **Room** - Shared buffer, per-sender exclusion index, subscriber set
//! - **Plan** - Merge-join of subscribers and senders into sends
//! - **Window** - Closes a window on the first quiet event-loop pass
//! - **Registry** - Rooms by name, each with its own window
//!
//! ## Architecture
//!
//! ```text
//! publish ──▶ ┌──────────┐  quiet pass  ┌────────────┐     ┌──────────────┐
//!             │   Room   │─────────────▶│   Window   │────▶│ DispatchPlan │──▶ transport
//!             └──────────┘              └────────────┘     └──────────────┘
//!                  ▲                                              │
//!                  └──────────── gap::reconstruct ◀──────────────┘
//! ```
//!
//! Everything here is synchronous and single-owner: a reactor owns the
//! [`RoomRegistry`] and calls [`RoomRegistry::on_before_wait`] and
//! [`RoomRegistry::on_after_ready`] once per pass.
//!
//! ```rust
//! use coalesce_core::{Action, Room, SubscriberId};
//!
//! let (a, b, c) = (SubscriberId::new(0, 0), SubscriberId::new(1, 0), SubscriberId::new(2, 0));
//! let mut room = Room::new("lobby");
//! for id in [a, b, c] {
//!     room.subscribe(id);
//! }
//!
//! room.publish(a, b"hello");
//! room.publish(b, b"world");
//!
//! let plan = room.flush();
//! assert_eq!(&plan.action_for(a).unwrap().payload()[..], b"world");
//! assert_eq!(&plan.action_for(b).unwrap().payload()[..], b"hello");
//! assert!(matches!(plan.action_for(c), Some(Action::SendVerbatim(_))));
//! ```

pub mod gap;
pub mod id;
pub mod plan;
pub mod registry;
pub mod room;
pub mod window;

pub use gap::{ByteRange, Gap};
pub use id::{IdArena, SubscriberId};
pub use plan::{Action, DispatchPlan, FlushStats};
pub use registry::{RegistryConfig, RegistryError, RegistryStats, RoomRegistry};
pub use room::{Room, RoomId};
pub use window::{WindowConfig, WindowController, WindowState};
