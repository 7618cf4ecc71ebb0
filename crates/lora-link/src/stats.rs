//! # Link Statistics
//!
//! Outbound transfer records and inbound reception counters. Both are
//! plain data with derived rates and serialize to JSON for the CLI.

use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

// ─── Transfer Record ────────────────────────────────────────────────────────

/// Outcome counters for one outbound transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    /// Chunks the payload was split into.
    pub total_chunks: usize,
    /// Chunks acknowledged by a success sentinel.
    pub sent_chunks: usize,
    /// Chunks that failed or timed out.
    pub failed_chunks: usize,
    /// Raw payload bytes (before base64).
    pub total_bytes: usize,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    finished: Option<Instant>,
}

impl TransferRecord {
    pub fn start(total_chunks: usize, total_bytes: usize) -> Self {
        Self {
            total_chunks,
            sent_chunks: 0,
            failed_chunks: 0,
            total_bytes,
            started: Instant::now(),
            finished: None,
        }
    }

    pub fn finish(&mut self) {
        if self.finished.is_none() {
            self.finished = Some(Instant::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Chunks not yet attempted.
    pub fn unattempted(&self) -> usize {
        self.total_chunks
            .saturating_sub(self.sent_chunks + self.failed_chunks)
    }

    /// Fraction of chunks acknowledged (0.0-1.0).
    pub fn success_rate(&self) -> f64 {
        if self.total_chunks == 0 {
            0.0
        } else {
            self.sent_chunks as f64 / self.total_chunks as f64
        }
    }

    /// Fraction of all chunks that have failed so far.
    pub fn failure_ratio(&self) -> f64 {
        if self.total_chunks == 0 {
            0.0
        } else {
            self.failed_chunks as f64 / self.total_chunks as f64
        }
    }

    /// Elapsed time, up to now if the transfer is still running.
    pub fn duration(&self) -> Duration {
        let end = self.finished.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.started)
    }

    /// Payload throughput in bits per second.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            (self.total_bytes as f64 * 8.0) / secs
        }
    }

    /// JSON-friendly snapshot including the derived values.
    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            total_chunks: self.total_chunks,
            sent_chunks: self.sent_chunks,
            failed_chunks: self.failed_chunks,
            total_bytes: self.total_bytes,
            success_rate: self.success_rate(),
            duration_s: self.duration().as_secs_f64(),
            throughput_bps: self.throughput_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub total_chunks: usize,
    pub sent_chunks: usize,
    pub failed_chunks: usize,
    pub total_bytes: usize,
    pub success_rate: f64,
    pub duration_s: f64,
    pub throughput_bps: f64,
}

// ─── Reception Stats ────────────────────────────────────────────────────────

/// Counters maintained by the transport's reader thread.
#[derive(Debug, Clone, Serialize)]
pub struct ReceptionStats {
    /// Lines read from the peer, of any kind.
    pub lines: u64,
    /// Single-packet `MSG` lines.
    pub messages: u64,
    /// Routed `[RX] Payload:` deliveries paired with their header.
    pub deliveries: u64,
    /// `FRAG` lines and `FRAG:` payload pieces accepted for reassembly.
    pub fragments: u64,
    /// Payloads completed from fragments.
    pub fragmented_payloads: u64,
    /// `FILECHUNK` payloads accepted.
    pub chunks: u64,
    /// Files written to the output directory.
    pub files_saved: u64,
    /// Decoded bytes written across all files.
    pub bytes_saved: u64,
    /// Malformed lines or payloads dropped.
    pub parse_errors: u64,
    /// Pieces rejected for bad index or total.
    pub rejected: u64,
    /// Completed assemblies that failed to decode.
    pub decode_failures: u64,
    /// Incomplete assemblies evicted as stale.
    pub incomplete: u64,
    /// Completion sentinels observed.
    pub signals: u64,
    #[serde(skip)]
    started: Instant,
}

impl ReceptionStats {
    pub fn new() -> Self {
        Self {
            lines: 0,
            messages: 0,
            deliveries: 0,
            fragments: 0,
            fragmented_payloads: 0,
            chunks: 0,
            files_saved: 0,
            bytes_saved: 0,
            parse_errors: 0,
            rejected: 0,
            decode_failures: 0,
            incomplete: 0,
            signals: 0,
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        Instant::now().saturating_duration_since(self.started)
    }

    /// Average saved-file throughput since the transport opened, bits/second.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            (self.bytes_saved as f64 * 8.0) / secs
        }
    }
}

impl Default for ReceptionStats {
    fn default() -> Self {
        Self::new()
    }
}
