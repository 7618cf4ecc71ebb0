//! # Line Dispatch
//!
//! Everything the reader thread does with one inbound line:
//!
//! ```text
//! line ─▶ classify ─┬─ MSG ─────────────────────────────┐
//!                   ├─ [RX] DATA + [RX] Payload ────────┤
//!                   ├─ FRAG ─▶ FragmentReassembler ─────┤ payload
//!                   ├─ sentinel ─▶ signal tap           ▼
//!                   └─ other ─▶ peer tap        route_payload ─┬─ FILECHUNK ─▶ ChunkAssembler
//!                                                              ├─ FRAG: ─▶ MeshReassembler ─▶ route_payload
//!                                                              ├─ FILE ─▶ legacy store
//!                                                              └─ text ─▶ messages.log
//! ```
//!
//! [`Dispatcher`] owns every reassembly tier outright; no other thread
//! touches them. A `[RX] DATA` header is held until the next
//! `[RX] Payload:` line, which is attributed to the header's source. Results leave through bounded channels that are written
//! with `try_send`, so a slow consumer can never stall the serial reader.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::assembler::{ArtifactStore, AssemblyError, ChunkAssembler, SavedArtifact};
use crate::config::ReceiverConfig;
use crate::reassembly::{FragmentReassembler, MeshReassembler};
use crate::stats::ReceptionStats;
use crate::wire::{
    classify_line, parse_payload, DataHeader, FragLine, InboundLine, MeshFragment, MsgLine,
    Payload, Signal,
};

const SIGNAL_CAPACITY: usize = 64;
const PEER_LINE_CAPACITY: usize = 512;

// ─── Events ─────────────────────────────────────────────────────────────────

/// What the reader observed, for display and logging consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Firmware diagnostic text.
    Peer(String),
    /// A plain text payload, already appended to `messages.log`.
    Message { source: String, text: String },
    /// A received file written to disk.
    FileSaved {
        source: String,
        filename: String,
        path: PathBuf,
        bytes: usize,
    },
    /// Something was dropped or looked wrong.
    Warning(String),
    /// A completion sentinel.
    Signal(Signal),
}

/// Receiving ends of the dispatcher's outputs.
#[derive(Debug, Clone)]
pub struct DispatchTaps {
    pub events: Receiver<LinkEvent>,
    pub signals: Receiver<Signal>,
    pub peer_lines: Receiver<String>,
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

pub struct Dispatcher {
    fragments: FragmentReassembler,
    mesh: MeshReassembler,
    chunks: ChunkAssembler,
    pending_delivery: Option<DataHeader>,
    events: Sender<LinkEvent>,
    signals: Sender<Signal>,
    peer_lines: Sender<String>,
    stats: Arc<Mutex<ReceptionStats>>,
    sweep_interval: Duration,
    last_sweep: Instant,
}

impl Dispatcher {
    /// Create the output directory and both reassembly tiers.
    pub fn new(
        config: &ReceiverConfig,
        stats: Arc<Mutex<ReceptionStats>>,
    ) -> std::io::Result<(Self, DispatchTaps)> {
        let store = ArtifactStore::new(&config.out_dir)?;
        let (events_tx, events_rx) = bounded(config.event_capacity);
        let (signals_tx, signals_rx) = bounded(SIGNAL_CAPACITY);
        let (peer_tx, peer_rx) = bounded(PEER_LINE_CAPACITY);

        let dispatcher = Self {
            fragments: FragmentReassembler::new(config.stale_after),
            mesh: MeshReassembler::new(config.stale_after),
            pending_delivery: None,
            chunks: ChunkAssembler::with_options(
                store,
                config.stale_after,
                config.temp_text_prefix.clone(),
            ),
            events: events_tx,
            signals: signals_tx,
            peer_lines: peer_tx,
            stats,
            sweep_interval: config.sweep_interval,
            last_sweep: Instant::now(),
        };
        let taps = DispatchTaps {
            events: events_rx,
            signals: signals_rx,
            peer_lines: peer_rx,
        };
        Ok((dispatcher, taps))
    }

    /// Classify and act on one line. Never fails; problems become warnings.
    pub fn handle_line(&mut self, line: &str) {
        self.bump(|s| s.lines += 1);
        debug!(target: "lora_link::peer", "{line}");

        match classify_line(line) {
            Err(e) => {
                self.bump(|s| s.parse_errors += 1);
                self.warn(format!("dropping malformed line ({e}): {line}"));
            }
            Ok(InboundLine::Msg(msg)) => self.on_msg(msg),
            Ok(InboundLine::Frag(frag)) => self.on_frag(frag),
            Ok(InboundLine::DataHeader(header)) => self.on_data_header(header),
            Ok(InboundLine::DataPayload(payload)) => match self.pending_delivery.take() {
                Some(header) => self.on_delivery(header, payload),
                None => {
                    debug!("payload line without a DATA header");
                    self.on_peer(line.to_string());
                }
            },
            Ok(InboundLine::Signal(signal)) => self.on_signal(signal),
            Ok(InboundLine::Peer(text)) => self.on_peer(text),
        }
    }

    fn on_peer(&mut self, text: String) {
        if let Err(TrySendError::Full(_)) = self.peer_lines.try_send(text.clone()) {
            debug!("peer line tap full, dropping");
        }
        self.emit(LinkEvent::Peer(text));
    }

    fn on_data_header(&mut self, header: DataHeader) {
        debug!(
            source = %header.source,
            seq = ?header.sequence,
            hops = ?header.hops,
            "routed delivery header"
        );
        if let Some(previous) = self.pending_delivery.replace(header) {
            debug!(source = %previous.source, "DATA header without payload, replaced");
        }
    }

    fn on_delivery(&mut self, header: DataHeader, payload: String) {
        self.bump(|s| s.deliveries += 1);
        info!(
            source = %header.source,
            seq = ?header.sequence,
            hops = ?header.hops,
            len = payload.len(),
            "routed payload received"
        );
        self.route_payload(&header.source, &payload);
    }

    fn on_msg(&mut self, msg: MsgLine) {
        self.bump(|s| s.messages += 1);
        info!(
            source = %msg.source,
            seq = msg.sequence,
            rssi = %msg.rssi,
            distance_m = %msg.distance_m,
            len = msg.text.len(),
            "MSG received"
        );
        self.route_payload(&msg.source, &msg.text);
    }

    fn on_frag(&mut self, frag: FragLine) {
        let FragLine {
            source,
            sequence,
            index,
            total,
            chunk,
            ..
        } = frag;
        match self
            .fragments
            .add_fragment(&source, sequence, index, total, chunk)
        {
            Ok(None) => self.bump(|s| s.fragments += 1),
            Ok(Some(payload)) => {
                self.bump(|s| {
                    s.fragments += 1;
                    s.fragmented_payloads += 1;
                });
                info!(%source, seq = sequence, len = payload.len(), "fragmented payload complete");
                self.route_payload(&source, &payload);
            }
            Err(e) => {
                self.bump(|s| s.rejected += 1);
                self.warn(format!("fragment {source}/{sequence} #{index} rejected: {e}"));
            }
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        self.bump(|s| s.signals += 1);
        if signal.is_success() {
            debug!(?signal, "completion sentinel");
        } else {
            info!(reason = signal.reason(), "failure sentinel");
        }
        if let Err(TrySendError::Full(_)) = self.signals.try_send(signal.clone()) {
            debug!("signal tap full, dropping");
        }
        self.emit(LinkEvent::Signal(signal));
    }

    fn route_payload(&mut self, source: &str, payload: &str) {
        match parse_payload(payload) {
            Err(e) => {
                self.bump(|s| s.parse_errors += 1);
                let preview: String = payload.chars().take(120).collect();
                self.warn(format!("dropping malformed payload from {source} ({e}): {preview}"));
            }
            Ok(Payload::FileChunk(chunk)) => {
                self.bump(|s| s.chunks += 1);
                let result = self.chunks.add_chunk(chunk);
                self.on_assembly(source, result);
            }
            Ok(Payload::MeshFragment(piece)) => self.on_mesh_fragment(source, piece),
            Ok(Payload::File(file)) => {
                let result = self.chunks.store_legacy(file).map(Some);
                self.on_assembly(source, result);
            }
            Ok(Payload::Text(text)) => self.deliver_text(source, text),
        }
    }

    fn on_mesh_fragment(&mut self, source: &str, piece: MeshFragment) {
        let MeshFragment {
            index,
            total,
            chunk,
        } = piece;
        match self.mesh.add_piece(source, index, total, chunk) {
            Ok(None) => self.bump(|s| s.fragments += 1),
            Ok(Some(payload)) => {
                self.bump(|s| {
                    s.fragments += 1;
                    s.fragmented_payloads += 1;
                });
                info!(%source, total, len = payload.len(), "mesh payload complete");
                self.route_payload(source, &payload);
            }
            Err(e) => {
                self.bump(|s| s.rejected += 1);
                self.warn(format!("piece {index}/{total} from {source} rejected: {e}"));
            }
        }
    }

    fn on_assembly(&mut self, source: &str, result: Result<Option<SavedArtifact>, AssemblyError>) {
        match result {
            Ok(None) => {}
            Ok(Some(saved)) => self.on_saved(source, saved),
            Err(AssemblyError::Rejected(e)) => {
                self.bump(|s| s.rejected += 1);
                self.warn(format!("chunk from {source} rejected: {e}"));
            }
            Err(AssemblyError::Decode(e)) => {
                self.bump(|s| s.decode_failures += 1);
                self.warn(format!("discarding assembly from {source}: {e}"));
            }
            Err(AssemblyError::Io(e)) => {
                self.warn(format!("could not write file from {source}: {e}"));
            }
        }
    }

    fn on_saved(&mut self, source: &str, saved: SavedArtifact) {
        self.bump(|s| {
            s.files_saved += 1;
            s.bytes_saved += saved.bytes as u64;
        });
        if let Some((declared, actual)) = saved.size_mismatch {
            self.emit(LinkEvent::Warning(format!(
                "{}: declared {declared} bytes, decoded {actual}",
                saved.filename
            )));
        }
        self.emit(LinkEvent::FileSaved {
            source: source.to_string(),
            filename: saved.filename,
            path: saved.path,
            bytes: saved.bytes,
        });
        if let Some(text) = saved.text {
            self.deliver_text(source, text);
        }
    }

    fn deliver_text(&mut self, source: &str, text: String) {
        info!(%source, len = text.len(), "text message");
        if let Err(e) = self.chunks.store().append_message(source, &text) {
            warn!(error = %e, "failed to append to message log");
        }
        self.emit(LinkEvent::Message {
            source: source.to_string(),
            text,
        });
    }

    /// Evict stale assemblies at every tier if the sweep interval has passed.
    pub fn maybe_sweep(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_sweep) < self.sweep_interval {
            return 0;
        }
        self.last_sweep = now;
        self.sweep(now)
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let evicted = self.fragments.evict_stale(now)
            + self.mesh.evict_stale(now)
            + self.chunks.evict_stale(now);
        if evicted > 0 {
            self.bump(|s| s.incomplete += evicted as u64);
            self.emit(LinkEvent::Warning(format!(
                "evicted {evicted} incomplete assemblies"
            )));
        }
        evicted
    }

    /// Incomplete radio-fragment sets plus command-path sets, and file assemblies.
    pub fn pending(&self) -> (usize, usize) {
        (
            self.fragments.pending() + self.mesh.pending(),
            self.chunks.pending(),
        )
    }

    pub fn store(&self) -> &ArtifactStore {
        self.chunks.store()
    }

    fn warn(&self, message: String) {
        warn!("{message}");
        self.emit(LinkEvent::Warning(message));
    }

    fn emit(&self, event: LinkEvent) {
        if let Err(TrySendError::Full(_)) = self.events.try_send(event) {
            debug!("event sink full, dropping event");
        }
    }

    fn bump(&self, f: impl FnOnce(&mut ReceptionStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> (tempfile::TempDir, Dispatcher, DispatchTaps, Arc<Mutex<ReceptionStats>>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ReceiverConfig {
            out_dir: dir.path().join("rx"),
            ..ReceiverConfig::default()
        };
        let stats = Arc::new(Mutex::new(ReceptionStats::new()));
        let (d, taps) = Dispatcher::new(&config, stats.clone()).unwrap();
        (dir, d, taps, stats)
    }

    fn drain(taps: &DispatchTaps) -> Vec<LinkEvent> {
        taps.events.try_iter().collect()
    }

    #[test]
    fn malformed_frag_is_dropped_and_processing_continues() {
        let (_dir, mut d, taps, stats) = dispatcher();
        d.handle_line("FRAG,a,b");
        d.handle_line("FRAG,n1,5,0,2,-90,10,FILECHUNK:test.txt:0:1:SGVs");
        d.handle_line("FRAG,n1,5,1,2,-90,10,bG8=");

        let events = drain(&taps);
        assert!(matches!(&events[0], LinkEvent::Warning(w) if w.contains("FRAG,a,b")));
        let saved = events
            .iter()
            .find_map(|e| match e {
                LinkEvent::FileSaved { path, bytes, .. } => Some((path.clone(), *bytes)),
                _ => None,
            })
            .expect("file should be saved");
        assert_eq!(saved.1, 5);
        assert_eq!(std::fs::read(saved.0).unwrap(), b"Hello");

        let s = stats.lock().unwrap();
        assert_eq!(s.parse_errors, 1);
        assert_eq!(s.fragments, 2);
        assert_eq!(s.files_saved, 1);
        assert_eq!(d.pending(), (0, 0));
    }

    #[test]
    fn chunked_file_over_msg_lines() {
        let (_dir, mut d, taps, _stats) = dispatcher();
        d.handle_line("MSG,n2,1,-80,100,FILECHUNK:test.txt:0:2:SGVs");
        d.handle_line("MSG,n2,2,-80,100,FILECHUNK:test.txt:1:2:bG8=");
        let path = drain(&taps)
            .into_iter()
            .find_map(|e| match e {
                LinkEvent::FileSaved { path, source, .. } => {
                    assert_eq!(source, "n2");
                    Some(path)
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(path.file_name().unwrap(), "test_rx.txt");
    }

    #[test]
    fn plain_message_is_logged() {
        let (_dir, mut d, taps, _stats) = dispatcher();
        d.handle_line("MSG,n3,9,-70,40,hello, mesh");
        assert_eq!(
            drain(&taps),
            vec![LinkEvent::Message {
                source: "n3".into(),
                text: "hello, mesh".into()
            }]
        );
        let log = std::fs::read_to_string(d.store().message_log_path()).unwrap();
        assert!(log.trim_end().ends_with("n3: hello, mesh"));
    }

    #[test]
    fn sentinels_reach_the_signal_tap() {
        let (_dir, mut d, taps, _stats) = dispatcher();
        d.handle_line("[TX DONE] seq=4");
        d.handle_line("[LoRa] RSSI -91");
        assert_eq!(taps.signals.try_recv().unwrap(), Signal::TxDone);
        assert_eq!(taps.peer_lines.try_recv().unwrap(), "[LoRa] RSSI -91");
    }

    #[test]
    fn temp_text_file_surfaces_as_message() {
        let (_dir, mut d, taps, _stats) = dispatcher();
        d.handle_line("MSG,n4,1,-60,5,FILECHUNK:_tmp_text_to_send.txt:0:1:aGkgdGhlcmU=");
        let events = drain(&taps);
        assert!(events.iter().any(|e| matches!(e, LinkEvent::FileSaved { .. })));
        assert!(events.contains(&LinkEvent::Message {
            source: "n4".into(),
            text: "hi there".into()
        }));
    }

    #[test]
    fn legacy_file_size_mismatch_warns() {
        let (_dir, mut d, taps, _stats) = dispatcher();
        d.handle_line("MSG,n5,1,-60,5,FILE:x.sac:9:SGVsbG8=");
        let events = drain(&taps);
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::Warning(w) if w.contains("declared 9"))));
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::FileSaved { bytes: 5, .. })));
    }

    #[test]
    fn mismatched_total_is_rejected() {
        let (_dir, mut d, _taps, stats) = dispatcher();
        d.handle_line("FRAG,a,1,0,3,-1,0,aa");
        d.handle_line("FRAG,a,1,1,2,-1,0,bb");
        assert_eq!(stats.lock().unwrap().rejected, 1);
        assert_eq!(d.pending(), (1, 0));
    }

    #[test]
    fn routed_fragments_rebuild_a_sized_file() {
        let (_dir, mut d, taps, stats) = dispatcher();
        d.handle_line("[RX] DATA from Node_1 (seq=5, hops=1)");
        d.handle_line("[RX] Payload: FRAG:0:2:FILE:x.sac:5:SGVs");
        d.handle_line("[ROUTE] table updated");
        d.handle_line("[RX] DATA from Node_1 (seq=6, hops=1)");
        d.handle_line("[RX] Payload: FRAG:1:2:bG8=");

        let events = drain(&taps);
        let path = events
            .iter()
            .find_map(|e| match e {
                LinkEvent::FileSaved { path, source, .. } => {
                    assert_eq!(source, "Node_1");
                    Some(path.clone())
                }
                _ => None,
            })
            .expect("file should be saved");
        assert_eq!(path.file_name().unwrap(), "x_rx.sac");
        assert_eq!(std::fs::read(&path).unwrap(), b"Hello");
        assert!(!events
            .iter()
            .any(|e| matches!(e, LinkEvent::Message { .. } | LinkEvent::Warning(_))));

        let s = stats.lock().unwrap();
        assert_eq!(s.deliveries, 2);
        assert_eq!(s.fragments, 2);
        assert_eq!(s.fragmented_payloads, 1);
        assert_eq!(d.pending(), (0, 0));
    }

    #[test]
    fn command_fragments_inside_msg_are_reassembled() {
        let (_dir, mut d, taps, _stats) = dispatcher();
        d.handle_line("MSG,Node_1,1,-80,100,FRAG:1:2: world");
        d.handle_line("MSG,Node_1,2,-80,100,FRAG:0:2:hello,");
        assert_eq!(
            drain(&taps),
            vec![LinkEvent::Message {
                source: "Node_1".into(),
                text: "hello, world".into()
            }]
        );
        let log = std::fs::read_to_string(d.store().message_log_path()).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn payload_without_header_is_peer_text() {
        let (_dir, mut d, taps, _stats) = dispatcher();
        d.handle_line("[RX] Payload: stray");
        assert_eq!(
            drain(&taps),
            vec![LinkEvent::Peer("[RX] Payload: stray".into())]
        );
    }

    #[test]
    fn sweep_evicts_every_tier() {
        let (_dir, mut d, _taps, stats) = dispatcher();
        d.handle_line("FRAG,a,1,0,3,-1,0,aa");
        d.handle_line("MSG,a,2,-1,0,FILECHUNK:f.bin:0:2:AAAA");
        d.handle_line("MSG,b,3,-1,0,FRAG:0:4:xx");
        assert_eq!(d.pending(), (2, 1));
        let later = Instant::now() + Duration::from_secs(301);
        assert_eq!(d.maybe_sweep(later), 3);
        assert_eq!(d.pending(), (0, 0));
        assert_eq!(stats.lock().unwrap().incomplete, 3);
    }
}
