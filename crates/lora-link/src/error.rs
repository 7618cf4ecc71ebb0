//! Error types for the host-side link.
//!
//! Expected control flow (a chunk that times out, a peer that answers with
//! `[ABORT]`) is not an error here; it is reported through
//! [`crate::session::TransferReport`]. These types cover real faults.

use thiserror::Error;

// ── Transport ───────────────────────────────────────────────────────

/// Faults on the serial channel or misuse of the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device could not be opened.
    #[error("failed to open serial port {port}: {reason}")]
    Connection { port: String, reason: String },

    /// A read or write on the channel failed.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been closed (or its reader has exited).
    #[error("transport is closed")]
    Closed,

    /// Another transfer session already owns the completion slot.
    #[error("a transfer is already in flight on this transport")]
    Busy,

    /// The caller passed something the wire grammar cannot carry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

// ── Wire parsing ────────────────────────────────────────────────────

/// A line or payload that does not match the wire grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{tag} line has {actual} fields, expected {expected}")]
    FieldCount {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{tag} field `{field}` is not an integer: {value:?}")]
    NotInteger {
        tag: &'static str,
        field: &'static str,
        value: String,
    },
}

// ── Payload decoding ────────────────────────────────────────────────

/// A completed assembly whose content could not be turned into bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("base64 decode failed for {name:?}: {source}")]
    Base64 {
        name: String,
        #[source]
        source: base64::DecodeError,
    },
}

// ── Media preparation ───────────────────────────────────────────────

/// Failures while turning a source file into transmission-ready bytes.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("image conversion failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("ffmpeg conversion failed: {0}")]
    Ffmpeg(String),
}
