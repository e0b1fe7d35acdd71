//! Cross-rank event framing.
//!
//! Each event handed to the sync layer becomes one frame:
//!
//! ```text
//! +--------+---------+---------------+------------------+
//! | len u32| link u32| delivery u64  | event bytes ...  |
//! +--------+---------+---------------+------------------+
//! ```
//!
//! All integers are little-endian. `len` counts the event bytes only. A
//! buffer is a plain concatenation of frames.

use crate::error::{SimError, SimResult};
use crate::types::{LinkId, SimTime};

/// Bytes preceding the event bytes of a frame.
pub const FRAME_HEADER_LEN: usize = 4 + 4 + 8;

/// An encoded event waiting for the next sync horizon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundEvent {
    /// Receiving end of the link
    pub link: LinkId,
    pub delivery_time: SimTime,
    /// Output of `Event::encode`
    pub bytes: Vec<u8>,
}

/// A frame read back from a buffer, borrowing its event bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub link: LinkId,
    pub delivery_time: SimTime,
    pub bytes: &'a [u8],
}

/// Appends one frame to `buf`.
pub fn encode_frame(buf: &mut Vec<u8>, event: &OutboundEvent) -> SimResult<()> {
    let len = u32::try_from(event.bytes.len()).map_err(|_| {
        SimError::serialization(format!(
            "event of {} bytes on {} does not fit a frame",
            event.bytes.len(),
            event.link
        ))
    })?;
    buf.reserve(FRAME_HEADER_LEN + event.bytes.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&event.link.0.to_le_bytes());
    buf.extend_from_slice(&event.delivery_time.to_le_bytes());
    buf.extend_from_slice(&event.bytes);
    Ok(())
}

/// Frames every event of `events`, in order, into one buffer.
pub fn encode_frames(events: &[OutboundEvent]) -> SimResult<Vec<u8>> {
    let total = events.iter().map(|e| FRAME_HEADER_LEN + e.bytes.len()).sum();
    let mut buf = Vec::with_capacity(total);
    for event in events {
        encode_frame(&mut buf, event)?;
    }
    Ok(buf)
}

/// Splits a buffer back into frames.
///
/// A partial header or a length running past the end of the buffer is a
/// serialization error.
pub fn decode_frames(buf: &[u8]) -> SimResult<Vec<Frame<'_>>> {
    let mut frames = Vec::new();
    let mut rest = buf;
    while !rest.is_empty() {
        if rest.len() < FRAME_HEADER_LEN {
            return Err(SimError::serialization(format!(
                "truncated frame header: {} of {} bytes at offset {}",
                rest.len(),
                FRAME_HEADER_LEN,
                buf.len() - rest.len()
            )));
        }
        let len = u32::from_le_bytes(le_array(&rest[0..4])) as usize;
        let link = LinkId(u32::from_le_bytes(le_array(&rest[4..8])));
        let delivery_time = SimTime::from_le_bytes(le_array(&rest[8..16]));
        let body = &rest[FRAME_HEADER_LEN..];
        if body.len() < len {
            return Err(SimError::serialization(format!(
                "truncated frame for {}: {} of {} event bytes",
                link,
                body.len(),
                len
            )));
        }
        frames.push(Frame {
            link,
            delivery_time,
            bytes: &body[..len],
        });
        rest = &body[len..];
    }
    Ok(frames)
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(link: u32, time: SimTime, bytes: &[u8]) -> OutboundEvent {
        OutboundEvent {
            link: LinkId(link),
            delivery_time: time,
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_layout_is_little_endian() {
        let mut buf = Vec::new();
        encode_frame(&mut buf, &event(0x0102, 0x0A0B, &[9, 8])).unwrap();
        assert_eq!(&buf[0..4], &[2, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[0x02, 0x01, 0, 0]);
        assert_eq!(&buf[8..16], &[0x0B, 0x0A, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[16..], &[9, 8]);
    }

    #[test]
    fn test_frames_in_order() {
        let events = vec![event(1, 10, b"abc"), event(3, 12, b""), event(1, 15, b"z")];
        let buf = encode_frames(&events).unwrap();
        let frames = decode_frames(&buf).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].bytes, b"abc");
        assert_eq!(frames[1].link, LinkId(3));
        assert!(frames[1].bytes.is_empty());
        assert_eq!(frames[2].delivery_time, 15);
    }

    #[test]
    fn test_truncation_is_an_error() {
        let buf = encode_frames(&[event(1, 10, b"abcdef")]).unwrap();
        assert!(decode_frames(&buf[..10]).unwrap_err().is_serialization());
        assert!(decode_frames(&buf[..buf.len() - 1]).unwrap_err().is_serialization());
        assert!(decode_frames(&[]).unwrap().is_empty());
    }
}
