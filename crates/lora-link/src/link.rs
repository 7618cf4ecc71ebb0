//! # Serial Link
//!
//! The byte channel to the modem, split into an owned reader and writer so
//! the background reader thread and the writer mutex never contend.
//!
//! Read timeouts are not errors here: [`LineReader`] reports them as
//! [`ReadOutcome::Idle`] so the reader loop can check its stop flag and run
//! periodic work between lines.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::TransportError;

// ─── Link ───────────────────────────────────────────────────────────────────

/// A bidirectional byte channel with a display name.
pub struct SerialLink {
    name: String,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink").field("name", &self.name).finish()
    }
}

impl SerialLink {
    /// Open a serial device at 8N1 with DTR/RTS asserted.
    pub fn open(port: &str, baud: u32, read_timeout: Duration) -> Result<Self, TransportError> {
        let connection_error = |e: serialport::Error| TransportError::Connection {
            port: port.to_string(),
            reason: e.to_string(),
        };

        let mut device = serialport::new(port, baud)
            .timeout(read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(connection_error)?;

        // Some USB bridges hold the MCU in reset until these are driven.
        if let Err(e) = device.write_data_terminal_ready(true) {
            debug!(port, error = %e, "could not assert DTR");
        }
        if let Err(e) = device.write_request_to_send(true) {
            debug!(port, error = %e, "could not assert RTS");
        }

        let reader = device.try_clone().map_err(connection_error)?;
        info!(port, baud, "serial port opened");

        Ok(Self {
            name: port.to_string(),
            reader: Box::new(reader),
            writer: Box::new(device),
        })
    }

    /// Build a link from arbitrary halves (loopback, pipes, test doubles).
    pub fn from_parts(
        name: impl Into<String>,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_parts(self) -> (String, Box<dyn Read + Send>, Box<dyn Write + Send>) {
        (self.name, self.reader, self.writer)
    }
}

// ─── Line Reader ────────────────────────────────────────────────────────────

/// Result of one [`LineReader::read_line`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete, non-blank line with trailing `\r`/`\n` removed.
    Line(String),
    /// The read timed out with no complete line available.
    Idle,
    /// The peer closed the channel.
    Eof,
}

/// Newline framing over a reader that may time out mid-line.
///
/// Bytes of a partial line survive a timeout and are completed by the next
/// call.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::with_capacity(256),
            eof: false,
        }
    }

    pub fn read_line(&mut self) -> io::Result<ReadOutcome> {
        loop {
            if self.eof {
                return Ok(ReadOutcome::Eof);
            }
            match self.inner.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    self.eof = true;
                    if self.pending.is_empty() {
                        return Ok(ReadOutcome::Eof);
                    }
                }
                Ok(_) if self.pending.last() != Some(&b'\n') => {
                    // Short read without terminator: the stream ended mid-line.
                    self.eof = true;
                }
                Ok(_) => {}
                Err(e) if is_idle(&e) => return Ok(ReadOutcome::Idle),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let line = take_line(&mut self.pending);
            if !line.is_empty() {
                return Ok(ReadOutcome::Line(line));
            }
        }
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Drain the buffer into a string, dropping only the trailing terminator.
fn take_line(buf: &mut Vec<u8>) -> String {
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
