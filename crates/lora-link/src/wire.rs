//! # Line Grammar
//!
//! Textual framing spoken with the modem firmware over the serial channel.
//! Every unit is one `\n`-terminated line.
//!
//! ```text
//! peer → host   MSG,<src>,<seq>,<rssi>,<distance_m>,<text>
//!               FRAG,<src>,<seq>,<idx>,<tot>,<rssi>,<distance_m>,<chunk>
//!               [RX] DATA from <src> (seq=<n>, hops=<h>)
//!               [RX] Payload: <payload>
//!               status lines carrying a completion sentinel
//! payload       FILECHUNK:<filename>:<idx>:<tot>:<base64chunk>
//!               FRAG:<idx>:<tot>:<chunk>
//!               FILE:<filename>:<base64data>
//!               FILE:<filename>:<size>:<base64data>
//! host → peer   FILECHUNK:...   SEND:<dest>:<level>:<data>
//!               DISCOVER:<dest>   ROUTES   STATS
//! ```
//!
//! Parsing is split in two stages: [`classify_line`] looks at raw peer
//! lines, [`parse_payload`] looks at fully reassembled payload text.

use crate::error::{ParseError, TransportError};
use crate::policy::ReliabilityLevel;

pub const MSG_TAG: &str = "MSG,";
pub const FRAG_TAG: &str = "FRAG,";
pub const FILECHUNK_TAG: &str = "FILECHUNK:";
pub const FILE_TAG: &str = "FILE:";
pub const MESH_FRAG_TAG: &str = "FRAG:";
pub const RX_DATA_MARKER: &str = "[RX] DATA from";
pub const RX_PAYLOAD_MARKER: &str = "[RX] Payload:";

pub const ROUTES_COMMAND: &str = "ROUTES";
pub const STATS_COMMAND: &str = "STATS";

// ─── Inbound Lines ──────────────────────────────────────────────────────────

/// A single-packet message: `MSG,<src>,<seq>,<rssi>,<distance_m>,<text>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgLine {
    pub source: String,
    pub sequence: u32,
    pub rssi: String,
    pub distance_m: String,
    /// Everything after the fifth comma, commas included.
    pub text: String,
}

/// One radio fragment: `FRAG,<src>,<seq>,<idx>,<tot>,<rssi>,<distance_m>,<chunk>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragLine {
    pub source: String,
    pub sequence: u32,
    pub index: u32,
    pub total: u32,
    pub rssi: String,
    pub distance_m: String,
    pub chunk: String,
}

impl MsgLine {
    pub fn rssi_dbm(&self) -> Option<f32> {
        self.rssi.trim().parse().ok()
    }
}

impl FragLine {
    pub fn rssi_dbm(&self) -> Option<f32> {
        self.rssi.trim().parse().ok()
    }
}

/// Header the mesh firmware prints before a routed delivery:
/// `[RX] DATA from <src> (seq=<n>, hops=<h>)`. The payload follows on the
/// next `[RX] Payload:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub source: String,
    pub sequence: Option<u32>,
    pub hops: Option<u32>,
}

/// Result of classifying one raw peer line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    Msg(MsgLine),
    Frag(FragLine),
    DataHeader(DataHeader),
    /// Text after `[RX] Payload:`, trimmed.
    DataPayload(String),
    Signal(Signal),
    /// Anything else: firmware diagnostics, routing tables, banners.
    Peer(String),
}

/// Classify a raw peer line (already stripped of its terminator).
///
/// `MSG,`/`FRAG,` prefixes and `[RX]` delivery lines win over sentinel
/// detection so that message text which happens to contain a sentinel is
/// still delivered as text.
pub fn classify_line(line: &str) -> Result<InboundLine, ParseError> {
    if let Some(rest) = line.strip_prefix(MSG_TAG) {
        return parse_msg(rest).map(InboundLine::Msg);
    }
    if let Some(rest) = line.strip_prefix(FRAG_TAG) {
        return parse_frag(rest).map(InboundLine::Frag);
    }
    if let Some(pos) = line.find(RX_DATA_MARKER) {
        let rest = &line[pos + RX_DATA_MARKER.len()..];
        return parse_data_header(rest).map(InboundLine::DataHeader);
    }
    if let Some(pos) = line.find(RX_PAYLOAD_MARKER) {
        let payload = line[pos + RX_PAYLOAD_MARKER.len()..].trim();
        return Ok(InboundLine::DataPayload(payload.to_string()));
    }
    if let Some(signal) = Signal::detect(line) {
        return Ok(InboundLine::Signal(signal));
    }
    Ok(InboundLine::Peer(line.to_string()))
}

fn parse_msg(rest: &str) -> Result<MsgLine, ParseError> {
    let fields: Vec<&str> = rest.splitn(5, ',').collect();
    if fields.len() != 5 {
        return Err(ParseError::FieldCount {
            tag: "MSG",
            expected: 5,
            actual: fields.len(),
        });
    }
    Ok(MsgLine {
        source: fields[0].to_string(),
        sequence: parse_int("MSG", "seq", fields[1])?,
        rssi: fields[2].to_string(),
        distance_m: fields[3].to_string(),
        text: fields[4].to_string(),
    })
}

fn parse_frag(rest: &str) -> Result<FragLine, ParseError> {
    let fields: Vec<&str> = rest.splitn(7, ',').collect();
    if fields.len() != 7 {
        return Err(ParseError::FieldCount {
            tag: "FRAG",
            expected: 7,
            actual: fields.len(),
        });
    }
    Ok(FragLine {
        source: fields[0].to_string(),
        sequence: parse_int("FRAG", "seq", fields[1])?,
        index: parse_int("FRAG", "idx", fields[2])?,
        total: parse_int("FRAG", "tot", fields[3])?,
        rssi: fields[4].to_string(),
        distance_m: fields[5].to_string(),
        chunk: fields[6].to_string(),
    })
}

fn parse_data_header(rest: &str) -> Result<DataHeader, ParseError> {
    let mut tokens = rest.split_whitespace();
    let source = tokens
        .next()
        .map(|t| t.trim_end_matches([',', '(']))
        .filter(|t| !t.is_empty())
        .ok_or(ParseError::FieldCount {
            tag: "[RX] DATA",
            expected: 1,
            actual: 0,
        })?;

    let mut header = DataHeader {
        source: source.to_string(),
        sequence: None,
        hops: None,
    };
    for token in tokens {
        let token = token.trim_matches(|c| matches!(c, '(' | ')' | ','));
        if let Some(value) = token.strip_prefix("seq=") {
            header.sequence = Some(parse_int("[RX] DATA", "seq", value)?);
        } else if let Some(value) = token.strip_prefix("hops=") {
            header.hops = Some(parse_int("[RX] DATA", "hops", value)?);
        }
    }
    Ok(header)
}

fn parse_int<T: std::str::FromStr>(
    tag: &'static str,
    field: &'static str,
    value: &str,
) -> Result<T, ParseError> {
    value.trim().parse().map_err(|_| ParseError::NotInteger {
        tag,
        field,
        value: value.to_string(),
    })
}

// ─── Completion Sentinels ───────────────────────────────────────────────────

/// Which outbound operation a sentinel answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalFamily {
    /// `FILECHUNK` lines: `[TX DONE]`, `[ABORT]`, `TX FAILED`.
    Chunk,
    /// `SEND:` commands: `[CMD] Send completed`, `[CMD] Send failed`.
    Command,
    /// `DISCOVER:` commands: `[RREP]`, `Route discovery failed`.
    Route,
}

/// A status line recognised as the end of an outbound operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    TxDone,
    TxAborted(String),
    TxFailed(String),
    SendCompleted,
    SendFailed(String),
    RouteReply(String),
    RouteFailed(String),
}

impl Signal {
    /// Detect a sentinel anywhere in the line.
    pub fn detect(line: &str) -> Option<Signal> {
        if line.contains("[CMD] Send completed") {
            Some(Signal::SendCompleted)
        } else if line.contains("[CMD] Send failed") || line.contains("[TX] Failed") {
            Some(Signal::SendFailed(line.to_string()))
        } else if line.contains("[TX DONE]") {
            Some(Signal::TxDone)
        } else if line.contains("[ABORT]") {
            Some(Signal::TxAborted(line.to_string()))
        } else if line.contains("TX FAILED") {
            Some(Signal::TxFailed(line.to_string()))
        } else if line.contains("[RREP]") {
            Some(Signal::RouteReply(line.to_string()))
        } else if line.contains("Route discovery failed") {
            Some(Signal::RouteFailed(line.to_string()))
        } else {
            None
        }
    }

    pub fn family(&self) -> SignalFamily {
        match self {
            Signal::TxDone | Signal::TxAborted(_) | Signal::TxFailed(_) => SignalFamily::Chunk,
            Signal::SendCompleted | Signal::SendFailed(_) => SignalFamily::Command,
            Signal::RouteReply(_) | Signal::RouteFailed(_) => SignalFamily::Route,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Signal::TxDone | Signal::SendCompleted | Signal::RouteReply(_)
        )
    }

    /// The peer line that carried a failure, or a fixed label on success.
    pub fn reason(&self) -> &str {
        match self {
            Signal::TxDone => "TX DONE",
            Signal::SendCompleted => "Send completed",
            Signal::TxAborted(line)
            | Signal::TxFailed(line)
            | Signal::SendFailed(line)
            | Signal::RouteReply(line)
            | Signal::RouteFailed(line) => line,
        }
    }
}

// ─── Reassembled Payloads ───────────────────────────────────────────────────

/// `FILECHUNK:<filename>:<idx>:<tot>:<base64chunk>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub filename: String,
    pub index: u32,
    pub total: u32,
    pub data: String,
}

/// Legacy one-shot `FILE:` payload, optionally carrying the raw size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFile {
    pub filename: String,
    pub declared_size: Option<usize>,
    pub data: String,
}

/// One command-path piece: `FRAG:<idx>:<tot>:<chunk>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshFragment {
    pub index: u32,
    pub total: u32,
    pub chunk: String,
}

/// A fully reassembled textual payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    FileChunk(FileChunk),
    MeshFragment(MeshFragment),
    File(LegacyFile),
    Text(String),
}

/// Route a reassembled payload by its prefix.
pub fn parse_payload(payload: &str) -> Result<Payload, ParseError> {
    if payload.starts_with(FILECHUNK_TAG) {
        let fields: Vec<&str> = payload.splitn(5, ':').collect();
        if fields.len() != 5 {
            return Err(ParseError::FieldCount {
                tag: "FILECHUNK",
                expected: 5,
                actual: fields.len(),
            });
        }
        return Ok(Payload::FileChunk(FileChunk {
            filename: fields[1].to_string(),
            index: parse_int("FILECHUNK", "idx", fields[2])?,
            total: parse_int("FILECHUNK", "tot", fields[3])?,
            data: fields[4].to_string(),
        }));
    }

    if payload.starts_with(MESH_FRAG_TAG) {
        let fields: Vec<&str> = payload.splitn(4, ':').collect();
        if fields.len() != 4 {
            return Err(ParseError::FieldCount {
                tag: "FRAG",
                expected: 4,
                actual: fields.len(),
            });
        }
        return Ok(Payload::MeshFragment(MeshFragment {
            index: parse_int("FRAG", "idx", fields[1])?,
            total: parse_int("FRAG", "tot", fields[2])?,
            chunk: fields[3].to_string(),
        }));
    }

    if payload.starts_with(FILE_TAG) {
        let fields: Vec<&str> = payload.splitn(3, ':').collect();
        if fields.len() != 3 {
            return Err(ParseError::FieldCount {
                tag: "FILE",
                expected: 3,
                actual: fields.len(),
            });
        }
        let filename = fields[1].to_string();
        // Base64 never contains ':', so a numeric prefix followed by ':' is a size.
        if let Some((size, data)) = fields[2].split_once(':') {
            if let Ok(size) = size.parse::<usize>() {
                return Ok(Payload::File(LegacyFile {
                    filename,
                    declared_size: Some(size),
                    data: data.to_string(),
                }));
            }
        }
        return Ok(Payload::File(LegacyFile {
            filename,
            declared_size: None,
            data: fields[2].to_string(),
        }));
    }

    Ok(Payload::Text(payload.to_string()))
}

// ─── Outbound Frames ────────────────────────────────────────────────────────

/// `FILECHUNK:<name>:<idx>:<total>:<chunk>` (no terminator).
pub fn file_chunk_frame(name: &str, index: usize, total: usize, chunk: &str) -> String {
    format!("{FILECHUNK_TAG}{name}:{index}:{total}:{chunk}")
}

/// `SEND:<dest>:<level>:<data>`.
pub fn send_frame(dest: &str, level: ReliabilityLevel, data: &str) -> String {
    format!("SEND:{dest}:{}:{data}", level.wire_value())
}

/// `SEND:<dest>:<level>:FRAG:<idx>:<total>:<chunk>`.
pub fn send_fragment_frame(
    dest: &str,
    level: ReliabilityLevel,
    index: usize,
    total: usize,
    chunk: &str,
) -> String {
    send_frame(dest, level, &format!("FRAG:{index}:{total}:{chunk}"))
}

/// `DISCOVER:<dest>`.
pub fn discover_frame(dest: &str) -> String {
    format!("DISCOVER:{dest}")
}

/// `FILE:<name>:<size>:<base64>` as carried by the fragmented command path.
pub fn sized_file_payload(name: &str, size: usize, base64: &str) -> String {
    format!("{FILE_TAG}{name}:{size}:{base64}")
}

/// Reject names that would break colon or line framing.
pub fn validate_field(kind: &str, value: &str) -> Result<(), TransportError> {
    if value.is_empty() {
        return Err(TransportError::InvalidArgument(format!("{kind} is empty")));
    }
    if value.contains([':', '\n', '\r']) {
        return Err(TransportError::InvalidArgument(format!(
            "{kind} {value:?} contains ':' or a line break"
        )));
    }
    Ok(())
}

/// Split `text` into pieces of at most `size` characters, preserving order.
///
/// Empty input yields a single empty piece so every transfer has at least
/// one chunk.
pub fn split_chars(text: &str, size: usize) -> Vec<&str> {
    assert!(size > 0, "chunk size must be non-zero");
    if text.is_empty() {
        return vec![""];
    }
    let mut pieces = Vec::with_capacity(text.len() / size + 1);
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == size {
            pieces.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    pieces.push(&text[start..]);
    pieces
}
