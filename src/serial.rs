use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{IceError, IceResult};
use crate::frame::{Frame, FrameCodec};

/// Candidate baud rates tried by autodetect, in order. Grounded in
/// `ice.py` `find_baud`, which tries 115200 then 2000000.
pub const AUTODETECT_BAUDS: [u32; 2] = [115_200, 2_000_000];

/// `SerialLink` default baud.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Per-read timeout used while waiting for a baud-autodetect reply.
const AUTODETECT_TIMEOUT: Duration = Duration::from_millis(50);

/// The side-band baud-renegotiation request: type `_`, subtype `b`,
/// 16-bit divider.
const TYPE_SET: u8 = b'_';

/// Reliable byte-stream abstraction over a serial device with a
/// configurable baud rate and bounded read timeout. Generic over the
/// transport so tests can substitute an in-memory duplex pipe for a real
/// `serialport::SerialPort`.
pub struct SerialLink<T> {
    device: T,
    baud: u32,
    read_timeout: Duration,
}

impl<T: Read + Write> SerialLink<T> {
    pub fn new(device: T, baud: u32) -> Self {
        Self {
            device,
            baud,
            read_timeout: Duration::from_millis(500),
        }
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub fn read_frame(&mut self) -> IceResult<Frame> {
        FrameCodec::read(&mut self.device, self.read_timeout)
    }

    pub fn write_frame(&mut self, frame: &Frame) -> IceResult<()> {
        FrameCodec::write(&mut self.device, frame)
    }

    /// Sends a baud-renegotiation command on the wire, then switches the
    /// host-side baud. The peer-side switch is assumed to already have
    /// happened by the time the caller observes the ACK for the `_b`
    /// request (that ACK itself is read by the caller through the normal
    /// `IceSession` request path; this helper only performs the raw byte
    /// probe used during autodetect and the divider encode/decode tables).
    pub fn encode_set_baud_divider(divider: u16) -> Frame {
        let payload = vec![b'b', (divider >> 8) as u8, divider as u8];
        Frame::new(TYPE_SET, 0, payload).expect("3-byte payload never exceeds 255")
    }

    pub fn divider_for_baud(baud: u32) -> IceResult<u16> {
        match baud {
            115_200 => Ok(0x00AE),
            2_000_000 => Ok(0x000A),
            3_000_000 => Ok(0x0007),
            other => Err(IceError::ParameterError(format!(
                "unsupported baud rate {other}"
            ))),
        }
    }

    pub fn baud_for_divider(divider: u16) -> IceResult<u32> {
        match divider {
            0x00AE => Ok(115_200),
            0x000A => Ok(2_000_000),
            0x0007 => Ok(3_000_000),
            other => Err(IceError::ParameterError(format!(
                "unknown baud divider {other:#06x}"
            ))),
        }
    }
}

/// Probes `candidates` in order: at each baud, writes the raw 3-byte `V`
/// probe (type `V`, event_id 0, length 0) and waits up to `per_candidate`
/// for any reply byte. The first baud that yields bytes wins. `open` is
/// called once per candidate to (re)open the device at that baud — this
/// lets callers reuse the same underlying port handle by reconfiguring it,
/// or open a fresh handle, as their transport requires.
pub fn find_baud<T: Read + Write>(
    candidates: &[u32],
    per_candidate: Duration,
    mut open: impl FnMut(u32) -> IceResult<T>,
) -> IceResult<(u32, T)> {
    for &baud in candidates {
        debug!("probing baud {baud}");
        let mut device = open(baud)?;
        let probe = [b'V', 0, 0];
        device.write_all(&probe)?;

        let mut buf = [0u8; 1];
        let deadline = std::time::Instant::now() + per_candidate;
        loop {
            match device.read(&mut buf) {
                Ok(0) => {
                    if std::time::Instant::now() >= deadline {
                        break;
                    }
                }
                Ok(_) => {
                    info!("autodetected baud {baud}");
                    return Ok((baud, device));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if std::time::Instant::now() >= deadline {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(IceError::Io(e)),
            }
        }
        warn!("no reply at baud {baud}");
    }
    Err(IceError::TimeoutError {
        elapsed: per_candidate * candidates.len() as u32,
        partial: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_divider_round_trips() {
        for baud in [115_200u32, 2_000_000, 3_000_000] {
            let divider = SerialLink::<std::io::Cursor<Vec<u8>>>::divider_for_baud(baud).unwrap();
            let decoded =
                SerialLink::<std::io::Cursor<Vec<u8>>>::baud_for_divider(divider).unwrap();
            assert_eq!(decoded, baud);
        }
    }

    #[test]
    fn rejects_unsupported_baud() {
        assert!(SerialLink::<std::io::Cursor<Vec<u8>>>::divider_for_baud(9600).is_err());
    }
}
