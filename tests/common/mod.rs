//! An in-memory duplex byte pipe standing in for the `socat`-paired
//! pseudo-terminals the original test suite used, so `IceSession` can
//! be driven against `Simulator` without real hardware.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

pub struct PipeReader {
    rx: Receiver<u8>,
    buf: VecDeque<u8>,
}

pub struct PipeWriter {
    tx: Sender<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() {
            match self.rx.recv_timeout(Duration::from_secs(5)) {
                Ok(b) => self.buf.push_back(b),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "pipe read timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
            while let Ok(b) = self.rx.try_recv() {
                self.buf.push_back(b);
            }
        }
        let n = out.len().min(self.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        for &b in data {
            self.tx
                .send(b)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds a pair of connected endpoints: `a`'s writer feeds `b`'s
/// reader and vice versa.
pub fn duplex() -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (a_to_b_tx, a_to_b_rx) = std::sync::mpsc::channel();
    let (b_to_a_tx, b_to_a_rx) = std::sync::mpsc::channel();
    let a = (
        PipeReader {
            rx: b_to_a_rx,
            buf: VecDeque::new(),
        },
        PipeWriter { tx: a_to_b_tx },
    );
    let b = (
        PipeReader {
            rx: a_to_b_rx,
            buf: VecDeque::new(),
        },
        PipeWriter { tx: b_to_a_tx },
    );
    (a, b)
}
