//! # Transfer Session
//!
//! Drives outbound operations over an open [`SerialTransport`]. A session
//! holds the transport's session slot for its whole lifetime, so the
//! completion sentinels it waits on cannot be consumed by anyone else.
//!
//! Every chunk follows the same handshake:
//!
//! ```text
//! drain stale signals ─▶ write frame ─▶ wait(sentinel | timeout)
//! ```
//!
//! The `FILECHUNK` path stops at the first failed or timed-out chunk. The
//! command path (`SEND:..:FRAG`) keeps going through isolated failures and
//! aborts once the failed share exceeds the backpressure ratio.
//!
//! Once a transfer has started, every way it can end, including a write
//! fault, comes back as a [`TransferReport`] so the counts of chunks already
//! acknowledged are never lost. A wait is only ever ended by a sentinel or
//! its own deadline; closing the transport does not cut it short.

use std::path::Path;
use std::sync::MutexGuard;
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossbeam_channel::RecvTimeoutError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::policy::{classify_path, ReliabilityLevel, TierProfile};
use crate::stats::{TransferRecord, TransferSummary};
use crate::transport::SerialTransport;
use crate::wire::{
    discover_frame, file_chunk_frame, send_fragment_frame, send_frame, sized_file_payload,
    split_chars, validate_field, Signal, SignalFamily, ROUTES_COMMAND, STATS_COMMAND,
};

// ─── Outcomes ───────────────────────────────────────────────────────────────

/// Why a transfer did not complete cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferFailure {
    #[error("chunk {index}: timeout after {}s", .waited.as_secs_f64())]
    Timeout { index: usize, waited: Duration },

    #[error("chunk {index}: {reason}")]
    Rejected { index: usize, reason: String },

    #[error("too many failures ({failed} of {total} chunks), aborting")]
    Backpressure { failed: usize, total: usize },

    #[error("{failed} of {total} chunks failed")]
    Incomplete { failed: usize, total: usize },

    /// The channel failed or was closed partway through.
    #[error("chunk {index}: link failure: {reason}")]
    Link { index: usize, reason: String },
}

/// Result of one transfer: counters plus the reason it fell short, if it did.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub record: TransferRecord,
    pub failure: Option<TransferFailure>,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn summary(&self) -> TransferSummary {
        self.record.summary()
    }
}

/// Result of a `DISCOVER` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// The `[RREP]` line naming the destination.
    Established(String),
    /// The firmware's failure line.
    Failed(String),
    TimedOut,
}

/// How one handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Completion {
    Done(String),
    Failed(String),
    TimedOut,
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct TransferSession<'t> {
    transport: &'t SerialTransport,
    _slot: MutexGuard<'t, ()>,
}

impl<'t> TransferSession<'t> {
    pub(crate) fn new(transport: &'t SerialTransport, slot: MutexGuard<'t, ()>) -> Self {
        Self {
            transport,
            _slot: slot,
        }
    }

    pub fn transport(&self) -> &SerialTransport {
        self.transport
    }

    /// Send `payload` as base64 `FILECHUNK` lines, one handshake per chunk.
    ///
    /// Invalid arguments are returned as errors before anything is written.
    /// A failure sentinel, a timeout or a write fault ends the transfer early
    /// and is reported in the returned [`TransferReport`]; no later chunk is
    /// written.
    pub fn send(
        &mut self,
        payload: &[u8],
        transmit_name: &str,
        chunk_size_chars: usize,
        chunk_timeout: Duration,
    ) -> Result<TransferReport, TransportError> {
        validate_field("transmit name", transmit_name)?;
        if chunk_size_chars == 0 {
            return Err(TransportError::InvalidArgument(
                "chunk size must be non-zero".into(),
            ));
        }

        let encoded = BASE64.encode(payload);
        let pieces = split_chars(&encoded, chunk_size_chars);
        let total = pieces.len();
        let mut record = TransferRecord::start(total, payload.len());
        info!(
            name = transmit_name,
            bytes = payload.len(),
            encoded_len = encoded.len(),
            chunk_size = chunk_size_chars,
            total,
            "starting chunked transfer"
        );

        for (index, piece) in pieces.iter().enumerate() {
            let frame = file_chunk_frame(transmit_name, index, total, piece);
            let completion = match self.exchange(&frame, chunk_timeout, |signal| {
                (signal.family() == SignalFamily::Chunk).then(|| signal.is_success())
            }) {
                Ok(completion) => completion,
                Err(e) => return Ok(link_failure(record, index, e)),
            };
            match completion {
                Completion::Done(_) => {
                    record.sent_chunks += 1;
                    info!(chunk = index + 1, total, "chunk acknowledged");
                }
                Completion::Failed(reason) => {
                    record.failed_chunks += 1;
                    warn!(chunk = index + 1, total, %reason, "chunk failed, aborting transfer");
                    return Ok(finish(record, Some(TransferFailure::Rejected { index, reason })));
                }
                Completion::TimedOut => {
                    record.failed_chunks += 1;
                    warn!(
                        chunk = index + 1,
                        total,
                        timeout_s = chunk_timeout.as_secs_f64(),
                        "no completion sentinel, aborting transfer"
                    );
                    return Ok(finish(
                        record,
                        Some(TransferFailure::Timeout {
                            index,
                            waited: chunk_timeout,
                        }),
                    ));
                }
            }
        }

        Ok(finish(record, None))
    }

    /// Send with the tier profile, honouring configured overrides.
    pub fn send_with_profile(
        &mut self,
        payload: &[u8],
        transmit_name: &str,
        profile: TierProfile,
    ) -> Result<TransferReport, TransportError> {
        let profile = self.apply_overrides(profile);
        debug!(
            name = transmit_name,
            level = %profile.level,
            chunk_size = profile.chunk_size_chars,
            timeout_s = profile.chunk_timeout.as_secs(),
            "transfer profile"
        );
        self.send(
            payload,
            transmit_name,
            profile.chunk_size_chars,
            profile.chunk_timeout,
        )
    }

    /// Send a named payload, inferring the tier from its extension unless
    /// `level` is given.
    pub fn send_named(
        &mut self,
        payload: &[u8],
        transmit_name: &str,
        level: Option<ReliabilityLevel>,
    ) -> Result<TransferReport, TransportError> {
        let profile = classify_path(Path::new(transmit_name), level);
        self.send_with_profile(payload, transmit_name, profile)
    }

    /// Send text under the temporary-text filename so the receiver shows
    /// it as a message.
    pub fn send_text_as_file(&mut self, text: &str) -> Result<TransferReport, TransportError> {
        let name = format!("{}.txt", self.transport.config().receiver.temp_text_prefix);
        self.send_with_profile(text.as_bytes(), &name, ReliabilityLevel::Low.profile())
    }

    // ─── Command Path ───────────────────────────────────────────────────

    /// Send `data` as `SEND:<dest>:<level>:FRAG:<idx>:<total>:<chunk>` lines.
    ///
    /// Failed or timed-out pieces are counted and skipped; the transfer
    /// aborts once more than the configured share of all pieces has failed.
    pub fn send_fragmented(
        &mut self,
        dest: &str,
        data: &str,
        level: ReliabilityLevel,
        chunk_size_chars: usize,
        chunk_timeout: Duration,
    ) -> Result<TransferReport, TransportError> {
        self.send_pieces(dest, data, data.len(), level, chunk_size_chars, chunk_timeout)
    }

    /// `payload_bytes` is what the record counts as transferred, which for
    /// a framed file is the raw size rather than the base64 text.
    fn send_pieces(
        &mut self,
        dest: &str,
        data: &str,
        payload_bytes: usize,
        level: ReliabilityLevel,
        chunk_size_chars: usize,
        chunk_timeout: Duration,
    ) -> Result<TransferReport, TransportError> {
        validate_field("destination", dest)?;
        reject_line_breaks(data)?;
        if chunk_size_chars == 0 {
            return Err(TransportError::InvalidArgument(
                "chunk size must be non-zero".into(),
            ));
        }

        let ratio = self.transport.config().transfer.backpressure_ratio;
        let pieces = split_chars(data, chunk_size_chars);
        let total = pieces.len();
        let mut record = TransferRecord::start(total, payload_bytes);
        info!(%dest, %level, total, chunk_size = chunk_size_chars, "starting fragmented send");

        for (index, piece) in pieces.iter().enumerate() {
            let frame = send_fragment_frame(dest, level, index, total, piece);
            let completion = match self.exchange(&frame, chunk_timeout, command_signal) {
                Ok(completion) => completion,
                Err(e) => return Ok(link_failure(record, index, e)),
            };
            match completion {
                Completion::Done(_) => {
                    record.sent_chunks += 1;
                    info!(chunk = index + 1, total, "piece sent");
                }
                Completion::Failed(reason) => {
                    record.failed_chunks += 1;
                    warn!(chunk = index + 1, total, %reason, "piece failed");
                }
                Completion::TimedOut => {
                    record.failed_chunks += 1;
                    warn!(chunk = index + 1, total, "piece timed out");
                }
            }

            if record.failed_chunks as f64 > total as f64 * ratio {
                warn!(
                    failed = record.failed_chunks,
                    total,
                    "too many failures, aborting"
                );
                let failure = TransferFailure::Backpressure {
                    failed: record.failed_chunks,
                    total,
                };
                return Ok(finish(record, Some(failure)));
            }
        }

        let failure = (record.failed_chunks > 0).then(|| TransferFailure::Incomplete {
            failed: record.failed_chunks,
            total,
        });
        Ok(finish(record, failure))
    }

    /// Short texts go out as one `SEND`; longer ones are fragmented.
    pub fn send_text(
        &mut self,
        dest: &str,
        text: &str,
        level: ReliabilityLevel,
    ) -> Result<TransferReport, TransportError> {
        validate_field("destination", dest)?;
        reject_line_breaks(text)?;
        let transfer = self.transport.config().transfer.clone();

        if text.chars().count() > transfer.single_packet_limit {
            return self.send_fragmented(
                dest,
                text,
                level,
                transfer.mesh_chunk_size,
                transfer.mesh_chunk_timeout,
            );
        }

        let mut record = TransferRecord::start(1, text.len());
        info!(%dest, %level, len = text.len(), "sending single-packet text");
        let frame = send_frame(dest, level, text);
        let completion = match self.exchange(&frame, transfer.mesh_chunk_timeout, command_signal) {
            Ok(completion) => completion,
            Err(e) => return Ok(link_failure(record, 0, e)),
        };
        let failure = match completion {
            Completion::Done(_) => {
                record.sent_chunks = 1;
                None
            }
            Completion::Failed(reason) => {
                record.failed_chunks = 1;
                Some(TransferFailure::Rejected { index: 0, reason })
            }
            Completion::TimedOut => {
                record.failed_chunks = 1;
                Some(TransferFailure::Timeout {
                    index: 0,
                    waited: transfer.mesh_chunk_timeout,
                })
            }
        };
        Ok(finish(record, failure))
    }

    /// Send a file over the command path as `FILE:<name>:<size>:<base64>`.
    pub fn send_mesh_file(
        &mut self,
        dest: &str,
        payload: &[u8],
        transmit_name: &str,
        level: Option<ReliabilityLevel>,
    ) -> Result<TransferReport, TransportError> {
        validate_field("transmit name", transmit_name)?;
        let level = classify_path(Path::new(transmit_name), level).level;
        let framed = sized_file_payload(transmit_name, payload.len(), &BASE64.encode(payload));
        info!(
            %dest,
            name = transmit_name,
            bytes = payload.len(),
            framed_len = framed.len(),
            %level,
            "sending file over command path"
        );
        let transfer = self.transport.config().transfer.clone();
        self.send_pieces(
            dest,
            &framed,
            payload.len(),
            level,
            transfer.mesh_chunk_size,
            transfer.mesh_chunk_timeout,
        )
    }

    /// Ask the firmware to find a route to `dest`.
    pub fn discover_route(
        &mut self,
        dest: &str,
        timeout: Option<Duration>,
    ) -> Result<DiscoveryOutcome, TransportError> {
        validate_field("destination", dest)?;
        let timeout = timeout.unwrap_or(self.transport.config().transfer.route_timeout);
        info!(%dest, timeout_s = timeout.as_secs_f64(), "discovering route");
        let completion = self.exchange(&discover_frame(dest), timeout, |signal| match signal {
            Signal::RouteReply(line) if line.contains(dest) => Some(true),
            Signal::RouteFailed(_) => Some(false),
            _ => None,
        })?;
        Ok(match completion {
            Completion::Done(line) => {
                info!(%dest, "route established");
                DiscoveryOutcome::Established(line)
            }
            Completion::Failed(line) => {
                warn!(%dest, "route discovery failed");
                DiscoveryOutcome::Failed(line)
            }
            Completion::TimedOut => {
                warn!(%dest, "route discovery timeout");
                DiscoveryOutcome::TimedOut
            }
        })
    }

    /// Routing table lines printed in response to `ROUTES`.
    pub fn query_routes(&mut self) -> Result<Vec<String>, TransportError> {
        self.query(ROUTES_COMMAND)
    }

    /// Node statistics lines printed in response to `STATS`.
    pub fn query_stats(&mut self) -> Result<Vec<String>, TransportError> {
        self.query(STATS_COMMAND)
    }

    // ─── Handshake ──────────────────────────────────────────────────────

    fn query(&mut self, command: &str) -> Result<Vec<String>, TransportError> {
        let peer_lines = self.transport.peer_lines();
        let stale = peer_lines.try_iter().count();
        if stale > 0 {
            debug!(stale, "discarding earlier peer lines");
        }
        self.transport.write_line(command)?;

        let deadline = Instant::now() + self.transport.config().transfer.query_window;
        let mut captured = Vec::new();
        loop {
            match peer_lines.recv_deadline(deadline) {
                Ok(line) => captured.push(line),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    if captured.is_empty() {
                        return Err(TransportError::Closed);
                    }
                    break;
                }
            }
        }
        info!(command, lines = captured.len(), "query complete");
        Ok(captured)
    }

    /// Write `frame` and wait for a sentinel that `accept` recognises.
    ///
    /// `accept` returns `Some(true)` for success, `Some(false)` for failure
    /// and `None` for sentinels that belong to some other operation. If the
    /// reader stops mid-wait the deadline is still waited out.
    fn exchange(
        &mut self,
        frame: &str,
        timeout: Duration,
        accept: impl Fn(&Signal) -> Option<bool>,
    ) -> Result<Completion, TransportError> {
        let signals = self.transport.signals();
        let stale = signals.try_iter().count();
        if stale > 0 {
            debug!(stale, "discarding stale sentinels");
        }

        self.transport.write_line(frame)?;

        let deadline = Instant::now() + timeout;
        loop {
            match signals.recv_deadline(deadline) {
                Ok(signal) => match accept(&signal) {
                    Some(true) => return Ok(Completion::Done(signal.reason().to_string())),
                    Some(false) => return Ok(Completion::Failed(signal.reason().to_string())),
                    None => debug!(?signal, "ignoring unrelated sentinel"),
                },
                Err(RecvTimeoutError::Timeout) => return Ok(Completion::TimedOut),
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("reader stopped during wait");
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return Ok(Completion::TimedOut);
                }
            }
        }
    }

    fn apply_overrides(&self, mut profile: TierProfile) -> TierProfile {
        let transfer = &self.transport.config().transfer;
        if let Some(chars) = transfer.chunk_size {
            profile = profile.with_chunk_size(chars);
        }
        if let Some(timeout) = transfer.chunk_timeout {
            profile = profile.with_timeout(timeout);
        }
        profile
    }
}

fn command_signal(signal: &Signal) -> Option<bool> {
    (signal.family() == SignalFamily::Command).then(|| signal.is_success())
}

fn reject_line_breaks(data: &str) -> Result<(), TransportError> {
    if data.contains(['\n', '\r']) {
        return Err(TransportError::InvalidArgument(
            "data contains a line break".into(),
        ));
    }
    Ok(())
}

fn link_failure(mut record: TransferRecord, index: usize, error: TransportError) -> TransferReport {
    record.failed_chunks += 1;
    warn!(chunk = index + 1, %error, "link failure, aborting transfer");
    finish(
        record,
        Some(TransferFailure::Link {
            index,
            reason: error.to_string(),
        }),
    )
}

fn finish(mut record: TransferRecord, failure: Option<TransferFailure>) -> TransferReport {
    record.finish();
    match &failure {
        None => info!(
            chunks = record.total_chunks,
            bytes = record.total_bytes,
            duration_s = record.duration().as_secs_f64(),
            throughput_bps = record.throughput_bps() as u64,
            "transfer complete"
        ),
        Some(f) => warn!(
            sent = record.sent_chunks,
            failed = record.failed_chunks,
            total = record.total_chunks,
            reason = %f,
            "transfer failed"
        ),
    }
    TransferReport { record, failure }
}
