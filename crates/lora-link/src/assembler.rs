//! # Chunk Assembly and Persistence
//!
//! Application-level reassembly of `FILECHUNK` payloads (keyed by the
//! transmitted filename) and the on-disk side of reception:
//!
//! - completed files land in the output directory as `<stem>_rx<suffix>`,
//!   never overwriting an earlier reception (`<stem>_rx_1<suffix>`, ...);
//! - plain messages are appended to `messages.log`.
//!
//! Decode failures discard the assembly; no partial file is ever written.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quanta::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::DecodeError;
use crate::reassembly::{Progress, ReassemblyError, ReassemblyTable, DEFAULT_STALE_AFTER};
use crate::wire::{FileChunk, LegacyFile};

pub const MESSAGE_LOG: &str = "messages.log";
pub const DEFAULT_TEMP_TEXT_PREFIX: &str = "_tmp_text_to_send";

/// Why a chunk or legacy file did not produce an artifact.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("chunk rejected: {0}")]
    Rejected(#[from] ReassemblyError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to persist artifact: {0}")]
    Io(#[from] io::Error),
}

// ─── Artifact Store ─────────────────────────────────────────────────────────

/// Output directory for received files and the message log.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    out_dir: PathBuf,
}

impl ArtifactStore {
    /// Create the directory if needed.
    pub fn new(out_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;
        Ok(Self { out_dir })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Receiver-side name for the `attempt`-th reception of `filename`.
    ///
    /// Directory components are stripped so a peer cannot write outside
    /// the output directory.
    pub fn output_name(filename: &str, attempt: u32) -> String {
        let base = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed");
        let path = Path::new(base);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(base);
        let suffix = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        if attempt == 0 {
            format!("{stem}_rx{suffix}")
        } else {
            format!("{stem}_rx_{attempt}{suffix}")
        }
    }

    /// Write `bytes` under the first free receiver-side name.
    pub fn persist(&self, filename: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let mut attempt = 0u32;
        loop {
            let path = self.out_dir.join(Self::output_name(filename, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    fill(file, &path, bytes)?;
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Append `[timestamp] source: text` to the message log.
    pub fn append_message(&self, source: &str, text: &str) -> io::Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.out_dir.join(MESSAGE_LOG))?;
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(log, "[{timestamp}] {source}: {text}")
    }

    pub fn message_log_path(&self) -> PathBuf {
        self.out_dir.join(MESSAGE_LOG)
    }
}

// ─── Saved Artifact ─────────────────────────────────────────────────────────

/// A file written to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    /// Name as transmitted.
    pub filename: String,
    pub path: PathBuf,
    pub bytes: usize,
    /// Decoded content when the filename follows the temporary-text convention.
    pub text: Option<String>,
    /// `(declared, actual)` when a legacy `FILE:` size did not match.
    pub size_mismatch: Option<(usize, usize)>,
}

// ─── Chunk Assembler ────────────────────────────────────────────────────────

/// Collects `FILECHUNK` pieces per filename and persists completed files.
#[derive(Debug)]
pub struct ChunkAssembler {
    table: ReassemblyTable<String>,
    store: ArtifactStore,
    temp_text_prefix: String,
}

impl ChunkAssembler {
    pub fn new(store: ArtifactStore) -> Self {
        Self::with_options(store, DEFAULT_STALE_AFTER, DEFAULT_TEMP_TEXT_PREFIX)
    }

    pub fn with_options(
        store: ArtifactStore,
        stale_after: Duration,
        temp_text_prefix: impl Into<String>,
    ) -> Self {
        Self {
            table: ReassemblyTable::new(stale_after),
            store,
            temp_text_prefix: temp_text_prefix.into(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Add one chunk; returns the saved artifact when the file completes.
    pub fn add_chunk(&mut self, chunk: FileChunk) -> Result<Option<SavedArtifact>, AssemblyError> {
        self.add_chunk_at(chunk, Instant::now())
    }

    pub fn add_chunk_at(
        &mut self,
        chunk: FileChunk,
        now: Instant,
    ) -> Result<Option<SavedArtifact>, AssemblyError> {
        let FileChunk {
            filename,
            index,
            total,
            data,
        } = chunk;

        match self
            .table
            .insert_at(filename.clone(), index, total, data, now)?
        {
            Progress::Pending { received, total } => {
                info!(file = %filename, chunk = index + 1, received, total, "FILECHUNK buffered");
                Ok(None)
            }
            Progress::Complete(encoded) => {
                debug!(file = %filename, encoded_len = encoded.len(), "FILECHUNK set complete");
                let raw = decode(&filename, &encoded)?;
                self.save(&filename, raw, None).map(Some)
            }
        }
    }

    /// Decode and persist a legacy one-shot `FILE:` payload.
    pub fn store_legacy(&self, file: LegacyFile) -> Result<SavedArtifact, AssemblyError> {
        info!(file = %file.filename, encoded_len = file.data.len(), "legacy FILE received");
        let raw = decode(&file.filename, &file.data)?;
        self.save(&file.filename, raw, file.declared_size)
    }

    fn save(
        &self,
        filename: &str,
        raw: Vec<u8>,
        declared_size: Option<usize>,
    ) -> Result<SavedArtifact, AssemblyError> {
        let size_mismatch = declared_size
            .filter(|&declared| declared != raw.len())
            .map(|declared| (declared, raw.len()));
        if let Some((declared, actual)) = size_mismatch {
            warn!(file = %filename, declared, actual, "decoded size does not match declared size");
        }

        let path = self.store.persist(filename, &raw)?;
        info!(file = %filename, path = %path.display(), bytes = raw.len(), "artifact written");

        let text = self
            .is_temp_text(filename)
            .then(|| String::from_utf8_lossy(&raw).into_owned());

        Ok(SavedArtifact {
            filename: filename.to_string(),
            path,
            bytes: raw.len(),
            text,
            size_mismatch,
        })
    }

    fn is_temp_text(&self, filename: &str) -> bool {
        Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| stem.starts_with(&self.temp_text_prefix))
    }

    pub fn evict_stale(&mut self, now: Instant) -> usize {
        let evicted = self.table.evict_stale(now);
        for e in &evicted {
            warn!(
                file = %e.key,
                received = e.received,
                total = e.total,
                age_s = e.age.as_secs(),
                "evicting stale file assembly"
            );
        }
        evicted.len()
    }

    pub fn progress(&self, filename: &str) -> Option<(usize, u32)> {
        self.table.progress(&filename.to_string())
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }
}

/// Write the whole artifact or remove the file, so a failed write leaves
/// nothing behind under the output name.
fn fill(mut out: impl Write, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let result = out.write_all(bytes).and_then(|()| out.flush());
    if let Err(e) = result {
        drop(out);
        if let Err(remove) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %remove, "could not remove partial file");
        }
        return Err(e);
    }
    Ok(())
}

fn decode(filename: &str, encoded: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64
        .decode(encoded.trim())
        .map_err(|source| DecodeError::Base64 {
            name: filename.to_string(),
            source,
        })
}
