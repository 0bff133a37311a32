use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::{IceError, IceResult};

/// ACK frame type, reserved.
pub const TYPE_ACK: u8 = 0;
/// NAK frame type, reserved.
pub const TYPE_NAK: u8 = 1;

/// `{type, event_id, length}` followed by `length` bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub event_id: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: u8, event_id: u8, payload: Vec<u8>) -> IceResult<Self> {
        if payload.len() > 255 {
            return Err(IceError::FormatError(format!(
                "payload length {} exceeds 255",
                payload.len()
            )));
        }
        Ok(Self {
            frame_type,
            event_id,
            payload,
        })
    }

    pub fn is_ack(&self) -> bool {
        self.frame_type == TYPE_ACK
    }

    pub fn is_nak(&self) -> bool {
        self.frame_type == TYPE_NAK
    }

    /// Whether this frame's length (255) signals "more fragments follow" on
    /// a fragmented stream. The caller decides which streams this applies to.
    pub fn is_fragment_continuation(&self) -> bool {
        self.payload.len() == 255
    }
}

/// Encodes and decodes frames on a raw byte stream. Does not itself own the
/// stream; `SerialLink` composes a `FrameCodec` with the open device.
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode(frame: &Frame) -> IceResult<Vec<u8>> {
        if frame.payload.len() > 255 {
            return Err(IceError::FormatError(format!(
                "payload length {} exceeds 255",
                frame.payload.len()
            )));
        }
        let mut buf = Vec::with_capacity(3 + frame.payload.len());
        buf.push(frame.frame_type);
        buf.push(frame.event_id);
        buf.push(frame.payload.len() as u8);
        buf.extend_from_slice(&frame.payload);
        Ok(buf)
    }

    pub fn write(w: &mut impl Write, frame: &Frame) -> IceResult<()> {
        let buf = Self::encode(frame)?;
        w.write_all(&buf)?;
        Ok(())
    }

    /// Reads one frame, honoring an overall `timeout` for the whole header +
    /// payload read. `read_exact_timed` is used so a partial read at timeout
    /// is reported with how many bytes arrived, per `TimeoutError{elapsed,
    /// partial}`.
    pub fn read(r: &mut impl Read, timeout: Duration) -> IceResult<Frame> {
        let start = Instant::now();
        let mut header = [0u8; 3];
        read_exact_timed(r, &mut header, timeout, start)?;

        let frame_type = header[0];
        let event_id = header[1];
        let length = header[2] as usize;

        let mut payload = vec![0u8; length];
        if length > 0 {
            read_exact_timed(r, &mut payload, timeout, start)?;
        }

        Ok(Frame {
            frame_type,
            event_id,
            payload,
        })
    }
}

/// Reads exactly `buf.len()` bytes, treating a short read as
/// `TimeoutError` once `deadline_start + timeout` has elapsed. A real
/// `Read` impl here is expected to itself be configured with a bounded
/// per-call timeout (see `SerialLink`), so this mostly accounts for
/// readers that return short reads without erroring.
fn read_exact_timed(
    r: &mut impl Read,
    buf: &mut [u8],
    timeout: Duration,
    start: Instant,
) -> IceResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        if start.elapsed() > timeout {
            return Err(IceError::TimeoutError {
                elapsed: start.elapsed(),
                partial: filled,
            });
        }
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(IceError::TimeoutError {
                    elapsed: start.elapsed(),
                    partial: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if start.elapsed() > timeout {
                    return Err(IceError::TimeoutError {
                        elapsed: start.elapsed(),
                        partial: filled,
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(IceError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encode_round_trips_through_decode() {
        let frame = Frame::new(b'b', 7, vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
        let bytes = FrameCodec::encode(&frame).unwrap();
        assert_eq!(bytes, vec![b'b', 7, 4, 0xde, 0xad, 0xbe, 0xef]);

        let mut cursor = Cursor::new(bytes);
        let decoded = FrameCodec::read(&mut cursor, Duration::from_millis(100)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_oversize_payload() {
        let payload = vec![0u8; 256];
        assert!(Frame::new(b'b', 0, payload).is_err());
    }

    #[test]
    fn short_read_times_out_with_partial_count() {
        let mut cursor = Cursor::new(vec![b'b', 0, 4, 0xde, 0xad]);
        let err = FrameCodec::read(&mut cursor, Duration::from_millis(10)).unwrap_err();
        match err {
            IceError::TimeoutError { partial, .. } => assert_eq!(partial, 2),
            other => panic!("expected TimeoutError, got {other:?}"),
        }
    }
}
