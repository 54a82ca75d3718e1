//! # coalesce-protocol
//!
//! Wire protocol for the coalesce broadcast server.
//!
//! Clients publish into rooms; the server answers with `batch` frames, each
//! carrying one coalesced window of a room.
//!
//! ## Frame Types
//!
//! - `Subscribe` / `Unsubscribe` - Room membership
//! - `Publish` - Contribute to a room's current window
//! - `Batch` - A flushed window delivered to a subscriber
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use coalesce_protocol::{codec, Frame};
//!
//! let frame = Frame::publish("chat:lobby", b"Hello, world!".to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, encode_batch, ProtocolError};
pub use frames::{codes, Frame, FrameType, PROTOCOL_VERSION};
