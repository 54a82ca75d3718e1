//! Length-prefixed MessagePack framing.
//!
//! ```text
//! ┌────────────────┬──────────────────────────────┐
//! │ len: u32 (BE)  │ MessagePack map, `len` bytes │
//! └────────────────┴──────────────────────────────┘
//! ```
//!
//! Bodies are written straight into the output buffer and the prefix is
//! patched afterwards, so encoding a window never copies its payload twice.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::cmp::Ordering;
use thiserror::Error;

use crate::frames::Frame;

/// Largest body accepted in either direction (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Framing and serialization failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Body length over [`MAX_FRAME_SIZE`].
    #[error("Frame body of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// The input ends before the frame does.
    #[error("Frame truncated: {0} more bytes expected")]
    Incomplete(usize),

    /// Serializing the body failed.
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The body is not a valid frame.
    #[error("Failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Well-formed body with unexpected surroundings.
    #[error("Malformed frame: {0}")]
    Invalid(String),
}

/// Borrowed form of [`Frame::Batch`].
///
/// Serializes to the same map as the owned frame without copying the
/// payload into a `Vec` first.
#[derive(Serialize)]
#[serde(tag = "type", rename = "batch")]
struct BatchRef<'a> {
    room: &'a str,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

/// Append `value` to `buf` as one frame. On error `buf` is left as it was.
fn write_framed<T: Serialize + ?Sized>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let start = buf.len();
    buf.put_u32(0);

    let written = {
        let mut writer = (&mut *buf).writer();
        rmp_serde::encode::write_named(&mut writer, value)
    };
    if let Err(e) = written {
        buf.truncate(start);
        return Err(e.into());
    }

    let body_len = buf.len() - start - LENGTH_PREFIX_SIZE;
    if body_len > MAX_FRAME_SIZE {
        buf.truncate(start);
        return Err(ProtocolError::FrameTooLarge(body_len));
    }

    buf[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&(body_len as u32).to_be_bytes());
    Ok(())
}

/// Body length announced by the prefix at the start of `data`, or `None`
/// if the prefix itself is not complete yet.
fn body_len(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(mut prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };

    let len = prefix.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

/// Encode a frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the body is too large.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    write_framed(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append an encoded frame to `buf`.
///
/// # Errors
///
/// Returns an error if serialization fails or the body is too large.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    write_framed(frame, buf)
}

/// Encode a batch frame straight from a borrowed payload.
///
/// Decodes as [`Frame::Batch`]. A flushed window is framed once this way
/// and the result shared across every verbatim recipient.
///
/// # Errors
///
/// Returns an error if serialization fails or the body is too large.
pub fn encode_batch(room: &str, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + room.len() + payload.len() + 32);
    write_framed(&BatchRef { room, payload }, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one frame from `data`.
///
/// # Errors
///
/// Returns an error if `data` is cut short, carries bytes past the end of
/// the frame, or does not hold a valid frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let Some(len) = body_len(data)? else {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    };

    let total = LENGTH_PREFIX_SIZE + len;
    match data.len().cmp(&total) {
        Ordering::Less => Err(ProtocolError::Incomplete(total - data.len())),
        Ordering::Greater => Err(ProtocolError::Invalid(format!(
            "{} trailing bytes after frame",
            data.len() - total
        ))),
        Ordering::Equal => Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..])?),
    }
}

/// Take the next complete frame off the front of a stream buffer.
///
/// Returns `Ok(None)` and leaves `buf` untouched until a whole frame has
/// arrived.
///
/// # Errors
///
/// Returns an error if the announced length is over the limit or the body
/// is not a valid frame. The offending frame has been consumed by then.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(len) = body_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    let framed = buf.split_to(LENGTH_PREFIX_SIZE + len);
    Ok(Some(rmp_serde::from_slice(&framed[LENGTH_PREFIX_SIZE..])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_frame_kind_survives_the_wire() {
        let frames = [
            Frame::subscribe(1, "lobby"),
            Frame::unsubscribe(2, "lobby"),
            Frame::publish("lobby", b"hi".to_vec()),
            Frame::publish_with_ack(7, "lobby", b"acked".to_vec()),
            Frame::batch("lobby", b"coalesced".to_vec()),
            Frame::ack(9),
            Frame::error(3, crate::codes::PUBLISH_FAILED, "Room not found: x"),
            Frame::ping(),
            Frame::pong(Some(1234)),
            Frame::connected("3v0", 30_000),
        ];

        for frame in frames {
            let wire = encode(&frame).unwrap();
            assert_eq!(decode(&wire).unwrap(), frame);
        }
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let wire = encode(&Frame::ack(1)).unwrap();
        let announced = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(announced, wire.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn test_encode_batch_matches_owned_frame() {
        let borrowed = encode_batch("lobby", b"helloworld").unwrap();
        let owned = encode(&Frame::batch("lobby", b"helloworld".to_vec())).unwrap();

        assert_eq!(borrowed, owned);
        assert_eq!(
            decode(&borrowed).unwrap(),
            Frame::batch("lobby", b"helloworld".to_vec())
        );
    }

    #[test]
    fn test_decode_reports_missing_bytes() {
        let wire = encode(&Frame::subscribe(1, "lobby")).unwrap();

        assert!(matches!(decode(&wire[..2]), Err(ProtocolError::Incomplete(2))));

        let cut = wire.len() - 3;
        assert!(matches!(decode(&wire[..cut]), Err(ProtocolError::Incomplete(3))));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut wire = BytesMut::from(&encode(&Frame::ping()).unwrap()[..]);
        wire.extend_from_slice(b"!");
        assert!(matches!(decode(&wire), Err(ProtocolError::Invalid(_))));
    }

    #[test]
    fn test_oversized_frames_are_refused() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];

        assert!(matches!(
            encode(&Frame::publish("lobby", payload.clone())),
            Err(ProtocolError::FrameTooLarge(_))
        ));
        assert!(matches!(
            encode_batch("lobby", &payload),
            Err(ProtocolError::FrameTooLarge(_))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        assert!(matches!(decode_from(&mut buf), Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn test_failed_encode_leaves_buffer_intact() {
        let mut buf = BytesMut::new();
        encode_into(&Frame::ack(1), &mut buf).unwrap();
        let before = buf.clone();

        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(encode_into(&Frame::publish("lobby", payload), &mut buf).is_err());
        assert_eq!(buf, before);
    }

    #[test]
    fn test_stream_yields_frames_as_they_complete() {
        let first = Frame::subscribe(1, "lobby");
        let second = Frame::publish("lobby", b"x".to_vec());

        let mut wire = BytesMut::new();
        encode_into(&first, &mut wire).unwrap();
        encode_into(&second, &mut wire).unwrap();

        // Feed the stream in 3-byte slices
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in wire.chunks(3) {
            buf.extend_from_slice(chunk);
            while let Some(frame) = decode_from(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, vec![first, second]);
        assert!(buf.is_empty());
    }
}
