//! In-memory link for tests and dry runs.
//!
//! [`pair`] returns a host-side [`SerialLink`] and the [`PeerEnd`] that
//! plays the modem. Reads on the host side time out like a real serial
//! port; dropping the `PeerEnd` looks like the device disappearing.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::link::SerialLink;

pub const LOOPBACK_READ_TIMEOUT: Duration = Duration::from_millis(20);

pub fn pair() -> (SerialLink, PeerEnd) {
    pair_with_timeout(LOOPBACK_READ_TIMEOUT)
}

pub fn pair_with_timeout(read_timeout: Duration) -> (SerialLink, PeerEnd) {
    let (to_host, host_rx) = unbounded();
    let (host_tx, from_host) = unbounded();
    let link = SerialLink::from_parts(
        "loopback",
        ChannelReader {
            rx: host_rx,
            buf: Vec::new(),
            pos: 0,
            timeout: read_timeout,
        },
        ChannelWriter { tx: host_tx },
    );
    let peer = PeerEnd {
        to_host,
        from_host,
        pending: Vec::new(),
    };
    (link, peer)
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
    timeout: Duration,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(bytes) => {
                    self.buf = bytes;
                    self.pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "loopback read timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct ChannelWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback peer is gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The modem side of a loopback pair.
pub struct PeerEnd {
    to_host: Sender<Vec<u8>>,
    from_host: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl PeerEnd {
    /// Emit one line towards the host (terminator added).
    pub fn send_line(&self, line: &str) -> io::Result<()> {
        self.send_raw(format!("{line}\n").into_bytes())
    }

    pub fn send_raw(&self, bytes: impl Into<Vec<u8>>) -> io::Result<()> {
        self.to_host
            .send(bytes.into())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "loopback host is gone"))
    }

    /// Next line written by the host, without its terminator.
    ///
    /// `None` on timeout or once the host side has been dropped.
    pub fn recv_line(&mut self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
            match self.from_host.recv_deadline(deadline) {
                Ok(bytes) => self.pending.extend_from_slice(&bytes),
                Err(_) => return None,
            }
        }
    }

    /// Every complete line the host has written so far.
    pub fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.recv_line(Duration::ZERO) {
            lines.push(line);
        }
        lines
    }
}
