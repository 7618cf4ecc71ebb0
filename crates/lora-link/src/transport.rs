//! # Serial Transport
//!
//! Exclusive owner of the byte channel to the modem.
//!
//! - one background reader thread per transport, running the [`Dispatcher`];
//! - writes serialized behind a mutex, independent of the reader;
//! - a single session slot so at most one transfer waits on completion
//!   sentinels at a time.
//!
//! The reader's lifetime is tied to [`SerialTransport::open`] and
//! [`SerialTransport::close`]; close joins it with a bounded wait.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant as StdInstant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::config::{LinkConfig, SerialConfig};
use crate::dispatch::{DispatchTaps, Dispatcher};
use crate::error::TransportError;
use crate::link::{LineReader, ReadOutcome, SerialLink};
use crate::session::TransferSession;
use crate::stats::ReceptionStats;
use crate::wire::Signal;

pub use crate::dispatch::LinkEvent;

struct ReaderThread {
    handle: thread::JoinHandle<()>,
    done: Receiver<()>,
}

pub struct SerialTransport {
    name: String,
    config: LinkConfig,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<ReaderThread>>,
    taps: DispatchTaps,
    stats: Arc<Mutex<ReceptionStats>>,
    session_slot: Mutex<()>,
}

impl SerialTransport {
    /// Open the configured serial device and start the reader.
    pub fn open(config: LinkConfig) -> Result<Self, TransportError> {
        info!(
            port = %config.serial.port,
            baud = config.serial.baud,
            "opening serial transport"
        );
        let link = SerialLink::open(
            &config.serial.port,
            config.serial.baud,
            config.serial.read_timeout,
        )?;
        Self::with_link(link, config)
    }

    /// Start a transport over an already-open link.
    ///
    /// Waits out the boot grace period and discards banner lines before
    /// the reader thread takes over.
    pub fn with_link(link: SerialLink, config: LinkConfig) -> Result<Self, TransportError> {
        let (name, reader, writer) = link.into_parts();
        let mut lines = LineReader::new(reader);
        drain_boot_banner(&mut lines, &name, &config.serial)?;

        let stats = Arc::new(Mutex::new(ReceptionStats::new()));
        let (dispatcher, taps) = Dispatcher::new(&config.receiver, stats.clone())?;
        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = bounded(1);

        let running_clone = running.clone();
        let handle = thread::Builder::new()
            .name(format!("lora-rx-{}", thread_label(&name)))
            .spawn(move || {
                reader_loop(lines, dispatcher, running_clone);
                let _ = done_tx.send(());
            })?;

        info!(link = %name, out_dir = %config.receiver.out_dir.display(), "transport ready");

        Ok(Self {
            name,
            config,
            writer: Mutex::new(Some(writer)),
            running,
            reader: Mutex::new(Some(ReaderThread {
                handle,
                done: done_rx,
            })),
            taps,
            stats,
            session_slot: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Write one line, appending the terminator, and flush.
    pub fn write_line(&self, text: &str) -> Result<(), TransportError> {
        if text.contains(['\n', '\r']) {
            return Err(TransportError::InvalidArgument(
                "outbound line contains a line break".into(),
            ));
        }
        let mut frame = String::with_capacity(text.len() + 1);
        frame.push_str(text);
        frame.push('\n');

        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(frame.as_bytes())?;
        writer.flush()?;
        debug!(target: "lora_link::tx", len = text.len(), "{}", preview(text));
        Ok(())
    }

    /// Claim the session slot. Fails with `Busy` while another session lives.
    pub fn session(&self) -> Result<TransferSession<'_>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        match self.session_slot.try_lock() {
            Ok(guard) => Ok(TransferSession::new(self, guard)),
            Err(TryLockError::Poisoned(poisoned)) => {
                Ok(TransferSession::new(self, poisoned.into_inner()))
            }
            Err(TryLockError::WouldBlock) => Err(TransportError::Busy),
        }
    }

    /// Events observed by the reader. Clones share one queue.
    pub fn events(&self) -> Receiver<LinkEvent> {
        self.taps.events.clone()
    }

    pub fn stats(&self) -> ReceptionStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Shared handle to the reception counters for external polling.
    pub fn stats_handle(&self) -> Arc<Mutex<ReceptionStats>> {
        self.stats.clone()
    }

    /// Whether the reader thread is still consuming lines.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop the reader, wait up to the join timeout, release the channel.
    /// Calling it again is a no-op.
    pub fn close(&self) {
        self.running.store(false, Ordering::Relaxed);

        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = reader {
            let join_timeout = self.config.serial.join_timeout;
            match reader.done.recv_timeout(join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if reader.handle.join().is_err() {
                        warn!(link = %self.name, "reader thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        link = %self.name,
                        timeout_ms = join_timeout.as_millis() as u64,
                        "reader did not stop in time, detaching"
                    );
                }
            }
        }

        let writer = self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if writer.is_some() {
            info!(link = %self.name, "transport closed");
        }
    }

    pub(crate) fn signals(&self) -> &Receiver<Signal> {
        &self.taps.signals
    }

    pub(crate) fn peer_lines(&self) -> &Receiver<String> {
        &self.taps.peer_lines
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Reader ─────────────────────────────────────────────────────────────────

fn drain_boot_banner<R: Read>(
    lines: &mut LineReader<R>,
    name: &str,
    config: &SerialConfig,
) -> Result<(), TransportError> {
    if !config.boot_grace.is_zero() {
        debug!(link = %name, grace_ms = config.boot_grace.as_millis() as u64, "waiting for peer boot");
        thread::sleep(config.boot_grace);
    }
    let deadline = StdInstant::now() + config.boot_drain;
    let mut discarded = 0usize;
    while StdInstant::now() < deadline {
        match lines.read_line()? {
            ReadOutcome::Line(line) => {
                discarded += 1;
                info!(link = %name, boot = true, "{line}");
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Eof => return Err(TransportError::Closed),
        }
    }
    if discarded > 0 {
        debug!(link = %name, discarded, "boot banner drained");
    }
    Ok(())
}

fn reader_loop<R: Read>(
    mut lines: LineReader<R>,
    mut dispatcher: Dispatcher,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match lines.read_line() {
            Ok(ReadOutcome::Line(line)) => dispatcher.handle_line(&line),
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Eof) => {
                info!("serial channel closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "serial read failed, stopping reader");
                break;
            }
        }
        dispatcher.maybe_sweep(Instant::now());
    }
    running.store(false, Ordering::Relaxed);
    debug!("reader stopped");
}

fn thread_label(name: &str) -> String {
    name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX).collect();
        format!("{head}...")
    }
}

/// Convenience for callers that poll: wait up to `timeout` for the next event.
pub fn next_event(events: &Receiver<LinkEvent>, timeout: Duration) -> Option<LinkEvent> {
    events.recv_timeout(timeout).ok()
}
