//! # lora-link
//!
//! Host-side transport for a LoRa modem reachable only through a
//! line-oriented serial channel. The radio protocol, mesh routing and
//! per-packet retries live in the modem firmware; this crate owns the
//! host's half of the contract.
//!
//! Inbound, the serial stream is classified line by line, radio fragments
//! are reassembled into payloads, and chunked file transfers are
//! reassembled into files on disk. Outbound, payloads are base64-encoded,
//! chunked and written one chunk at a time, each chunk waiting for the
//! firmware's completion sentinel.
//!
//! ## Crate structure
//!
//! - [`wire`]: Line grammar, sentinels, outbound frame builders
//! - [`reassembly`]: Index-keyed reassembly table, radio fragment tier
//! - [`assembler`]: File chunk tier, output naming, message log
//! - [`policy`]: Reliability tiers and content classification
//! - [`link`]: Serial device and newline framing
//! - [`loopback`]: In-memory link for tests and dry runs
//! - [`dispatch`]: Per-line classification and payload routing
//! - [`transport`]: Channel owner: reader thread, writer, session slot
//! - [`session`]: Outbound transfers and mesh commands
//! - [`media`]: Image/audio conversion before sending
//! - [`stats`]: Transfer records and reception counters
//! - [`config`]: TOML configuration
//! - [`error`]: Error types

pub mod assembler;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod loopback;
pub mod media;
pub mod policy;
pub mod reassembly;
pub mod session;
pub mod stats;
pub mod transport;
pub mod wire;

pub use assembler::{ArtifactStore, ChunkAssembler, SavedArtifact};
pub use config::LinkConfig;
pub use error::{DecodeError, MediaError, ParseError, TransportError};
pub use media::{DefaultPreparer, MediaPreparer, PreparedMedia};
pub use policy::{classify, ContentCategory, ReliabilityLevel, TierProfile};
pub use reassembly::{FragmentKey, FragmentReassembler};
pub use session::{DiscoveryOutcome, TransferFailure, TransferReport, TransferSession};
pub use stats::{ReceptionStats, TransferRecord};
pub use transport::{LinkEvent, SerialTransport};
