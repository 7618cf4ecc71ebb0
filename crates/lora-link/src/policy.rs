//! # Reliability Policy
//!
//! Maps content to one of the firmware's five reliability tiers and to the
//! host-side defaults used when sending it. The tier numbering is part of
//! the wire contract (`SEND:<dest>:<level>:...`) and mirrors the firmware
//! enumeration exactly.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Reliability Level ──────────────────────────────────────────────────────

/// Firmware reliability tier. Discriminants are the on-wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ReliabilityLevel {
    /// No acknowledgement.
    None = 0,
    /// Text and voice.
    Low = 1,
    /// Images.
    Medium = 2,
    /// Documents and archives.
    High = 3,
    /// Scientific and seismic data.
    Critical = 4,
}

impl ReliabilityLevel {
    pub const ALL: [ReliabilityLevel; 5] = [
        ReliabilityLevel::None,
        ReliabilityLevel::Low,
        ReliabilityLevel::Medium,
        ReliabilityLevel::High,
        ReliabilityLevel::Critical,
    ];

    pub fn wire_value(self) -> u8 {
        self as u8
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Retries the firmware attempts per radio packet at this tier.
    pub fn firmware_retries(self) -> u8 {
        match self {
            ReliabilityLevel::None => 0,
            ReliabilityLevel::Low => 1,
            ReliabilityLevel::Medium => 2,
            ReliabilityLevel::High => 3,
            ReliabilityLevel::Critical => 5,
        }
    }

    /// Per-attempt acknowledgement timeout used by the firmware.
    pub fn firmware_ack_timeout(self) -> Duration {
        Duration::from_secs(match self {
            ReliabilityLevel::None => 0,
            ReliabilityLevel::Low => 2,
            ReliabilityLevel::Medium => 5,
            ReliabilityLevel::High => 8,
            ReliabilityLevel::Critical => 15,
        })
    }

    /// Host defaults for this tier.
    pub fn profile(self) -> TierProfile {
        let (chunk_size_chars, chunk_timeout_s) = match self {
            ReliabilityLevel::None => (40_000, 30),
            ReliabilityLevel::Low => (40_000, 60),
            ReliabilityLevel::Medium => (20_000, 120),
            ReliabilityLevel::High => (10_000, 180),
            ReliabilityLevel::Critical => (5_000, 300),
        };
        TierProfile {
            level: self,
            chunk_size_chars,
            chunk_timeout: Duration::from_secs(chunk_timeout_s),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReliabilityLevel::None => "none",
            ReliabilityLevel::Low => "low",
            ReliabilityLevel::Medium => "medium",
            ReliabilityLevel::High => "high",
            ReliabilityLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ReliabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReliabilityLevel {
    type Err = String;

    /// Accepts the wire digit (`"0"`..`"4"`) or the tier name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(value) = s.parse::<u8>() {
            return Self::from_wire(value)
                .ok_or_else(|| format!("reliability level {value} out of range 0..=4"));
        }
        Self::ALL
            .into_iter()
            .find(|level| level.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown reliability level {s:?}"))
    }
}

// ─── Tier Profile ───────────────────────────────────────────────────────────

/// Host-side transfer defaults derived from a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierProfile {
    pub level: ReliabilityLevel,
    /// Base64 characters per outbound chunk.
    pub chunk_size_chars: usize,
    /// How long to wait for a completion sentinel per chunk.
    pub chunk_timeout: Duration,
}

impl TierProfile {
    pub fn with_chunk_size(mut self, chars: usize) -> Self {
        self.chunk_size_chars = chars;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }
}

// ─── Content Category ───────────────────────────────────────────────────────

/// Coarse content kind used to pick a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Text,
    Voice,
    Image,
    Document,
    Archive,
    Seismic,
    Other,
}

impl ContentCategory {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "text" => ContentCategory::Text,
            "voice" | "audio" => ContentCategory::Voice,
            "image" => ContentCategory::Image,
            "document" => ContentCategory::Document,
            "archive" => ContentCategory::Archive,
            "seismic" => ContentCategory::Seismic,
            _ => return None,
        })
    }

    /// Static extension table; the extension is matched without its dot.
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "txt" | "log" | "csv" | "json" | "text" => ContentCategory::Text,
            "wav" | "mp3" | "ogg" | "flac" | "m4a" | "aac" | "wma" | "aif" | "aiff" => {
                ContentCategory::Voice
            }
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "tif" | "tiff" | "webp" => {
                ContentCategory::Image
            }
            "pdf" | "doc" | "docx" => ContentCategory::Document,
            "zip" | "tar" | "gz" => ContentCategory::Archive,
            "mseed" | "miniseed" | "sac" => ContentCategory::Seismic,
            _ => ContentCategory::Other,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(ContentCategory::Other)
    }

    pub fn reliability(self) -> ReliabilityLevel {
        match self {
            ContentCategory::Text | ContentCategory::Voice => ReliabilityLevel::Low,
            ContentCategory::Image | ContentCategory::Other => ReliabilityLevel::Medium,
            ContentCategory::Document | ContentCategory::Archive => ReliabilityLevel::High,
            ContentCategory::Seismic => ReliabilityLevel::Critical,
        }
    }
}

// ─── Classification ─────────────────────────────────────────────────────────

/// Classify a category name (`"seismic"`) or a file extension (`".mseed"`,
/// `"png"`) into a tier profile. Unknown inputs fall back to MEDIUM.
pub fn classify(category_or_extension: &str) -> TierProfile {
    ContentCategory::from_name(category_or_extension)
        .unwrap_or_else(|| ContentCategory::from_extension(category_or_extension))
        .reliability()
        .profile()
}

/// Classify by file extension, honouring an explicit override.
pub fn classify_path(path: &Path, explicit: Option<ReliabilityLevel>) -> TierProfile {
    explicit
        .unwrap_or_else(|| ContentCategory::from_path(path).reliability())
        .profile()
}
