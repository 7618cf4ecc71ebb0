//! # Integration tests: TransferSession ↔ scripted modem
//!
//! The modem is a thread on the far side of a loopback link. It records
//! every line the host writes and answers with whatever status lines the
//! test's script returns, so handshakes, timeouts and aborts can be
//! exercised without hardware.

use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lora_link::link::SerialLink;
use lora_link::loopback::{self, PeerEnd};
use lora_link::transport::next_event;
use lora_link::{
    DiscoveryOutcome, LinkConfig, LinkEvent, ReliabilityLevel, SerialTransport, TransferFailure,
};

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Modem double: answers each host line with the lines its script returns.
struct ScriptedPeer {
    seen: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ScriptedPeer {
    fn spawn<F>(mut peer: PeerEnd, mut script: F) -> Self
    where
        F: FnMut(usize, &str) -> Vec<String> + Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let seen_clone = seen.clone();
        let stop_clone = stop.clone();
        let handle = thread::spawn(move || {
            let mut count = 0;
            while !stop_clone.load(Ordering::Relaxed) {
                let Some(line) = peer.recv_line(Duration::from_millis(20)) else {
                    // Returns at once when the host is gone.
                    thread::sleep(Duration::from_millis(5));
                    continue;
                };
                seen_clone.lock().unwrap().push(line.clone());
                for reply in script(count, &line) {
                    if peer.send_line(&reply).is_err() {
                        return;
                    }
                }
                count += 1;
            }
        });
        Self {
            seen,
            stop,
            handle: Some(handle),
        }
    }

    fn lines(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for ScriptedPeer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn test_config(out_dir: &Path) -> LinkConfig {
    let mut config = LinkConfig::default();
    config.serial.boot_grace = Duration::ZERO;
    config.serial.boot_drain = Duration::ZERO;
    config.receiver.out_dir = out_dir.to_path_buf();
    config.transfer.mesh_chunk_timeout = Duration::from_secs(2);
    config.transfer.query_window = Duration::from_millis(300);
    config
}

fn setup<F>(script: F) -> (tempfile::TempDir, SerialTransport, ScriptedPeer)
where
    F: FnMut(usize, &str) -> Vec<String> + Send + 'static,
{
    let dir = tempfile::tempdir().unwrap();
    let (link, peer) = loopback::pair();
    let transport = SerialTransport::with_link(link, test_config(dir.path())).unwrap();
    let peer = ScriptedPeer::spawn(peer, script);
    (dir, transport, peer)
}

/// Host-side writer that breaks after a fixed number of writes.
struct FailAfter {
    inner: Box<dyn Write + Send>,
    writes_left: usize,
}

impl Write for FailAfter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.writes_left == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "cable pulled"));
        }
        self.writes_left -= 1;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn ack_everything(_: usize, line: &str) -> Vec<String> {
    if line.starts_with("FILECHUNK:") {
        vec!["[TX DONE]".into()]
    } else {
        vec!["[CMD] Send completed".into()]
    }
}

// ─── FILECHUNK Path ─────────────────────────────────────────────────────────

#[test]
fn hello_is_sent_as_two_acknowledged_chunks() {
    let (_dir, transport, peer) = setup(ack_everything);
    let report = transport
        .session()
        .unwrap()
        .send(b"Hello", "test.txt", 4, Duration::from_secs(2))
        .unwrap();

    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(report.record.total_chunks, 2);
    assert_eq!(report.record.sent_chunks, 2);
    assert_eq!(report.record.total_bytes, 5);
    assert_eq!(
        peer.lines(),
        vec![
            "FILECHUNK:test.txt:0:2:SGVs".to_string(),
            "FILECHUNK:test.txt:1:2:bG8=".to_string(),
        ]
    );
}

#[test]
fn silent_peer_times_out_after_first_chunk() {
    let (_dir, transport, peer) = setup(|_, _| Vec::new());
    let started = Instant::now();
    let report = transport
        .session()
        .unwrap()
        .send(b"0123456789abcdef", "quiet.bin", 4, Duration::from_millis(400))
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(!report.is_success());
    let failure = report.failure.as_ref().unwrap();
    assert!(matches!(failure, TransferFailure::Timeout { index: 0, .. }));
    assert!(failure.to_string().contains("timeout"));
    assert_eq!(report.record.sent_chunks, 0);
    assert_eq!(report.record.failed_chunks, 1);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(peer.lines().len(), 1);
}

#[test]
fn abort_sentinel_stops_the_transfer() {
    let (_dir, transport, peer) = setup(|i, _| {
        if i == 1 {
            vec!["[ABORT] max retries reached".into()]
        } else {
            vec!["[TX DONE]".into()]
        }
    });
    let report = transport
        .session()
        .unwrap()
        .send(&[7u8; 30], "abort.bin", 8, Duration::from_secs(2))
        .unwrap();

    match report.failure {
        Some(TransferFailure::Rejected { index, ref reason }) => {
            assert_eq!(index, 1);
            assert!(reason.contains("[ABORT]"));
        }
        ref other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(report.record.sent_chunks, 1);
    assert_eq!(peer.lines().len(), 2);
}

#[test]
fn unrelated_sentinels_do_not_complete_a_chunk() {
    let (_dir, transport, _peer) = setup(|_, _| {
        vec![
            "[CMD] Send completed".into(),
            "[RREP] Node_9".into(),
            "[TX DONE]".into(),
        ]
    });
    let report = transport
        .session()
        .unwrap()
        .send(b"abc", "mixed.txt", 100, Duration::from_secs(2))
        .unwrap();
    assert!(report.is_success());
}

#[test]
fn empty_payload_is_one_empty_chunk() {
    let (_dir, transport, peer) = setup(ack_everything);
    let report = transport
        .session()
        .unwrap()
        .send(b"", "empty.txt", 10, Duration::from_secs(2))
        .unwrap();
    assert!(report.is_success());
    assert_eq!(peer.lines(), vec!["FILECHUNK:empty.txt:0:1:".to_string()]);
}

#[test]
fn names_with_colons_are_rejected_before_writing() {
    let (_dir, transport, peer) = setup(ack_everything);
    let err = transport
        .session()
        .unwrap()
        .send(b"x", "bad:name.txt", 10, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, lora_link::TransportError::InvalidArgument(_)));
    thread::sleep(Duration::from_millis(50));
    assert!(peer.lines().is_empty());
}

#[test]
fn text_as_file_uses_temp_name() {
    let (_dir, transport, peer) = setup(ack_everything);
    let report = transport
        .session()
        .unwrap()
        .send_text_as_file("hi there")
        .unwrap();
    assert!(report.is_success());
    assert_eq!(
        peer.lines(),
        vec!["FILECHUNK:_tmp_text_to_send.txt:0:1:aGkgdGhlcmU=".to_string()]
    );
}

#[test]
fn write_fault_mid_transfer_keeps_counts() {
    let dir = tempfile::tempdir().unwrap();
    let (link, peer) = loopback::pair();
    let (name, reader, writer) = link.into_parts();
    let link = SerialLink::from_parts(
        name,
        reader,
        FailAfter {
            inner: writer,
            writes_left: 1,
        },
    );
    let transport = SerialTransport::with_link(link, test_config(dir.path())).unwrap();
    let peer = ScriptedPeer::spawn(peer, ack_everything);

    let report = transport
        .session()
        .unwrap()
        .send(b"Hello", "test.txt", 4, Duration::from_secs(2))
        .unwrap();

    match report.failure {
        Some(TransferFailure::Link { index, ref reason }) => {
            assert_eq!(index, 1);
            assert!(reason.contains("cable pulled"), "{reason}");
        }
        ref other => panic!("expected link failure, got {other:?}"),
    }
    assert_eq!(report.record.sent_chunks, 1);
    assert_eq!(report.record.failed_chunks, 1);
    assert_eq!(peer.lines(), vec!["FILECHUNK:test.txt:0:2:SGVs".to_string()]);
}

#[test]
fn close_during_wait_runs_out_the_deadline() {
    let (_dir, transport, peer) = setup(|_, _| Vec::new());
    let timeout = Duration::from_millis(600);
    let started = Instant::now();

    let report = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(100));
            transport.close();
        });
        transport
            .session()
            .unwrap()
            .send(b"Hello", "a.txt", 4, timeout)
            .unwrap()
    });

    assert!(started.elapsed() >= timeout);
    assert_eq!(
        report.failure,
        Some(TransferFailure::Timeout {
            index: 0,
            waited: timeout
        })
    );
    assert_eq!(report.record.sent_chunks, 0);
    assert_eq!(report.record.failed_chunks, 1);
    assert_eq!(peer.lines().len(), 1);
}

// ─── Command Path ───────────────────────────────────────────────────────────

#[test]
fn backpressure_aborts_after_four_of_ten_failures() {
    let (_dir, transport, peer) = setup(|i, _| {
        if i < 4 {
            vec!["[CMD] Send failed: no ACK".into()]
        } else {
            vec!["[CMD] Send completed".into()]
        }
    });
    let report = transport
        .session()
        .unwrap()
        .send_fragmented(
            "Node_2",
            "abcdefghij",
            ReliabilityLevel::Medium,
            1,
            Duration::from_secs(2),
        )
        .unwrap();

    assert_eq!(
        report.failure,
        Some(TransferFailure::Backpressure {
            failed: 4,
            total: 10
        })
    );
    let lines = peer.lines();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0], "SEND:Node_2:2:FRAG:0:10:a");
    assert_eq!(lines[3], "SEND:Node_2:2:FRAG:3:10:d");
}

#[test]
fn isolated_failure_is_skipped_and_reported() {
    let (_dir, transport, peer) = setup(|i, _| {
        if i == 2 {
            vec!["[TX] Failed after 3 retries".into()]
        } else {
            vec!["[CMD] Send completed".into()]
        }
    });
    let report = transport
        .session()
        .unwrap()
        .send_fragmented(
            "Node_2",
            "abcdefghij",
            ReliabilityLevel::Low,
            1,
            Duration::from_secs(2),
        )
        .unwrap();

    assert_eq!(
        report.failure,
        Some(TransferFailure::Incomplete {
            failed: 1,
            total: 10
        })
    );
    assert_eq!(report.record.sent_chunks, 9);
    assert_eq!(peer.lines().len(), 10);
}

#[test]
fn close_mid_fragmented_send_reports_link_failure() {
    let (_dir, transport, peer) = setup(|i, _| {
        if i == 0 {
            vec!["[CMD] Send completed".into()]
        } else {
            Vec::new()
        }
    });

    let report = thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(150));
            transport.close();
        });
        transport
            .session()
            .unwrap()
            .send_fragmented(
                "Node_2",
                "abcdefghij",
                ReliabilityLevel::Low,
                1,
                Duration::from_millis(400),
            )
            .unwrap()
    });

    assert!(matches!(
        report.failure,
        Some(TransferFailure::Link { index: 2, .. })
    ));
    assert_eq!(report.record.sent_chunks, 1);
    assert_eq!(report.record.failed_chunks, 2);
    assert_eq!(peer.lines().len(), 2);
}

#[test]
fn short_text_is_a_single_send() {
    let (_dir, transport, peer) = setup(ack_everything);
    let report = transport
        .session()
        .unwrap()
        .send_text("Node_2", "Hello Node_2", ReliabilityLevel::Low)
        .unwrap();
    assert!(report.is_success());
    assert_eq!(peer.lines(), vec!["SEND:Node_2:1:Hello Node_2".to_string()]);
}

#[test]
fn long_text_is_fragmented() {
    let (_dir, transport, peer) = setup(ack_everything);
    let text = "x".repeat(200);
    let report = transport
        .session()
        .unwrap()
        .send_text("Node_3", &text, ReliabilityLevel::Low)
        .unwrap();
    assert!(report.is_success());
    let lines = peer.lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], format!("SEND:Node_3:1:FRAG:0:2:{}", "x".repeat(150)));
    assert_eq!(lines[1], format!("SEND:Node_3:1:FRAG:1:2:{}", "x".repeat(50)));
}

#[test]
fn mesh_file_carries_size_and_tier() {
    let (_dir, transport, peer) = setup(ack_everything);
    let report = transport
        .session()
        .unwrap()
        .send_mesh_file("Node_4", b"Hello", "x.mseed", None)
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.record.total_bytes, 5);
    assert_eq!(
        peer.lines(),
        vec!["SEND:Node_4:4:FRAG:0:1:FILE:x.mseed:5:SGVsbG8=".to_string()]
    );
}

#[test]
fn route_discovery_waits_for_matching_reply() {
    let (_dir, transport, _peer) = setup(|_, _| {
        vec![
            "[RREQ] broadcast id=7".into(),
            "[RREP] Node_5 via Node_3".into(),
            "[RREP] Node_2 via Node_3 hops=2".into(),
        ]
    });
    let outcome = transport
        .session()
        .unwrap()
        .discover_route("Node_2", Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(
        outcome,
        DiscoveryOutcome::Established("[RREP] Node_2 via Node_3 hops=2".into())
    );
}

#[test]
fn route_discovery_failure_and_timeout() {
    let (_dir, transport, _peer) = setup(|i, _| {
        if i == 0 {
            vec!["[ERR] Route discovery failed for Node_8".into()]
        } else {
            Vec::new()
        }
    });
    let mut session = transport.session().unwrap();
    assert!(matches!(
        session.discover_route("Node_8", Some(Duration::from_secs(2))).unwrap(),
        DiscoveryOutcome::Failed(_)
    ));
    assert_eq!(
        session
            .discover_route("Node_8", Some(Duration::from_millis(200)))
            .unwrap(),
        DiscoveryOutcome::TimedOut
    );
}

#[test]
fn routes_query_captures_peer_output() {
    let (_dir, transport, peer) = setup(|_, line| {
        if line == "ROUTES" {
            vec![
                "=== Routing Table ===".into(),
                "Node_2 via Node_2 hops=1".into(),
                "Node_3 via Node_2 hops=2".into(),
            ]
        } else {
            Vec::new()
        }
    });
    let lines = transport.session().unwrap().query_routes().unwrap();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1], "Node_2 via Node_2 hops=1");
    assert_eq!(peer.lines(), vec!["ROUTES".to_string()]);
}

// ─── End to End ─────────────────────────────────────────────────────────────

/// Host A sends FILECHUNK lines; the modem pair radios each one across as
/// FRAG lines to host B, which must rebuild the file.
#[test]
fn file_crosses_two_hosts_through_radio_fragments() {
    let dir_b = tempfile::tempdir().unwrap();
    let (link_b, peer_b) = loopback::pair();
    let receiver = SerialTransport::with_link(link_b, test_config(dir_b.path())).unwrap();
    let events = receiver.events();

    let mut sequence = 0u32;
    let (_dir_a, sender, _peer_a) = setup(move |_, line| {
        sequence += 1;
        let pieces: Vec<String> = line
            .as_bytes()
            .chunks(50)
            .map(|c| String::from_utf8(c.to_vec()).unwrap())
            .collect();
        let total = pieces.len();
        // Deliver out of order to exercise the reassembler.
        for (idx, piece) in pieces.iter().enumerate().rev() {
            peer_b
                .send_line(&format!("FRAG,Node_1,{sequence},{idx},{total},-97,850,{piece}"))
                .unwrap();
        }
        vec!["[TX DONE]".into()]
    });

    let payload: Vec<u8> = (0..2000u32).map(|i| (i * 7 % 251) as u8).collect();
    let report = sender
        .session()
        .unwrap()
        .send(&payload, "sample.sac", 300, Duration::from_secs(2))
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.record.total_chunks, 9);

    let deadline = Instant::now() + Duration::from_secs(5);
    let saved = loop {
        assert!(Instant::now() < deadline, "file was not saved in time");
        if let Some(LinkEvent::FileSaved { path, source, .. }) =
            next_event(&events, Duration::from_millis(100))
        {
            assert_eq!(source, "Node_1");
            break path;
        }
    };
    assert_eq!(saved.file_name().unwrap(), "sample_rx.sac");
    assert_eq!(std::fs::read(&saved).unwrap(), payload);
    assert_eq!(receiver.stats().files_saved, 1);
}

/// Host A sends a file over the command path; the modem pair prints each
/// routed piece on host B as a `[RX] DATA` header plus `[RX] Payload:` line.
#[test]
fn mesh_file_crosses_two_hosts_as_routed_deliveries() {
    let dir_b = tempfile::tempdir().unwrap();
    let (link_b, peer_b) = loopback::pair();
    let receiver = SerialTransport::with_link(link_b, test_config(dir_b.path())).unwrap();
    let events = receiver.events();

    let mut sequence = 0u32;
    let (_dir_a, sender, peer_a) = setup(move |_, line| {
        let data = line.splitn(4, ':').nth(3).unwrap_or_default();
        sequence += 1;
        peer_b
            .send_line(&format!("[RX] DATA from Node_1 (seq={sequence}, hops=2)"))
            .unwrap();
        peer_b.send_line("[ROUTE] Node_1 via Node_3").unwrap();
        peer_b.send_line(&format!("[RX] Payload: {data}")).unwrap();
        vec!["[CMD] Send completed".into()]
    });

    let payload: Vec<u8> = (0..300u32).map(|i| (i * 13 % 256) as u8).collect();
    let report = sender
        .session()
        .unwrap()
        .send_mesh_file("Node_2", &payload, "station.mseed", None)
        .unwrap();
    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(report.record.total_bytes, 300);
    assert_eq!(report.record.total_chunks, 3);
    assert!(peer_a.lines()[0].starts_with("SEND:Node_2:4:FRAG:0:3:FILE:station.mseed:300:"));

    let deadline = Instant::now() + Duration::from_secs(5);
    let saved = loop {
        assert!(Instant::now() < deadline, "file was not saved in time");
        match next_event(&events, Duration::from_millis(100)) {
            Some(LinkEvent::FileSaved { path, source, .. }) => {
                assert_eq!(source, "Node_1");
                break path;
            }
            Some(LinkEvent::Message { text, .. }) => panic!("piece logged as text: {text}"),
            _ => {}
        }
    };
    assert_eq!(saved.file_name().unwrap(), "station_rx.mseed");
    assert_eq!(std::fs::read(&saved).unwrap(), payload);
    assert_eq!(receiver.stats().deliveries, 3);
}
