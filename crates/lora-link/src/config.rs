use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::assembler::DEFAULT_TEMP_TEXT_PREFIX;

pub const CONFIG_VERSION: u32 = 1;

// ─── TOML Input ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkConfigInput {
    pub version: u32,
    pub serial: SerialConfigInput,
    pub receiver: ReceiverConfigInput,
    pub transfer: TransferConfigInput,
    pub media: MediaConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SerialConfigInput {
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub read_timeout_ms: Option<u64>,
    pub boot_grace_ms: Option<u64>,
    pub boot_drain_ms: Option<u64>,
    pub join_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReceiverConfigInput {
    pub out_dir: Option<PathBuf>,
    pub stale_after_s: Option<u64>,
    pub sweep_interval_s: Option<u64>,
    pub temp_text_prefix: Option<String>,
    pub event_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransferConfigInput {
    pub chunk_size: Option<usize>,
    pub chunk_timeout_s: Option<u64>,
    pub backpressure_ratio: Option<f64>,
    pub single_packet_limit: Option<usize>,
    pub mesh_chunk_size: Option<usize>,
    pub mesh_chunk_timeout_s: Option<u64>,
    pub route_timeout_s: Option<u64>,
    pub query_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MediaConfigInput {
    pub jpeg_quality: Option<u8>,
    pub mp3_bitrate: Option<String>,
    pub ffmpeg: Option<String>,
}

// ─── Resolved Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// Read timeout on the device; each expiry is an idle tick for the reader.
    pub read_timeout: Duration,
    /// Pause after opening while the peer resets.
    pub boot_grace: Duration,
    /// Window during which boot banner lines are read and discarded.
    pub boot_drain: Duration,
    /// Upper bound on waiting for the reader thread in `close()`.
    pub join_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            baud: 115_200,
            read_timeout: Duration::from_millis(200),
            boot_grace: Duration::from_millis(2000),
            boot_drain: Duration::from_millis(1500),
            join_timeout: Duration::from_millis(1000),
        }
    }
}

fn default_port() -> &'static str {
    if cfg!(windows) {
        "COM3"
    } else {
        "/dev/ttyUSB0"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub out_dir: PathBuf,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    pub temp_text_prefix: String,
    pub event_capacity: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("received_files"),
            stale_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            temp_text_prefix: DEFAULT_TEMP_TEXT_PREFIX.to_string(),
            event_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Overrides the tier's chunk size when set.
    pub chunk_size: Option<usize>,
    /// Overrides the tier's per-chunk timeout when set.
    pub chunk_timeout: Option<Duration>,
    /// Fraction of failed chunks above which a fragmented send aborts.
    pub backpressure_ratio: f64,
    /// Longest text sent as a single `SEND` command.
    pub single_packet_limit: usize,
    /// Characters per `SEND:..:FRAG` piece on the command path.
    pub mesh_chunk_size: usize,
    /// Wait for `[CMD] Send completed` per command-path piece.
    pub mesh_chunk_timeout: Duration,
    pub route_timeout: Duration,
    pub query_window: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            chunk_timeout: None,
            backpressure_ratio: 0.3,
            single_packet_limit: 150,
            mesh_chunk_size: 150,
            mesh_chunk_timeout: Duration::from_secs(60),
            route_timeout: Duration::from_secs(10),
            query_window: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    pub jpeg_quality: u8,
    pub mp3_bitrate: String,
    pub ffmpeg: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            mp3_bitrate: "64k".to_string(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub version: u32,
    pub serial: SerialConfig,
    pub receiver: ReceiverConfig,
    pub transfer: TransferConfig,
    pub media: MediaConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            serial: SerialConfig::default(),
            receiver: ReceiverConfig::default(),
            transfer: TransferConfig::default(),
            media: MediaConfig::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl LinkConfigInput {
    pub fn resolve(self) -> Result<LinkConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let sd = SerialConfig::default();
        let serial = SerialConfig {
            port: non_empty(self.serial.port).unwrap_or(sd.port),
            baud: match self.serial.baud {
                Some(0) => return Err("serial.baud must be non-zero".into()),
                Some(b) => b,
                None => sd.baud,
            },
            read_timeout: self
                .serial
                .read_timeout_ms
                .map(|ms| Duration::from_millis(ms.clamp(10, 5000)))
                .unwrap_or(sd.read_timeout),
            boot_grace: self
                .serial
                .boot_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(sd.boot_grace),
            boot_drain: self
                .serial
                .boot_drain_ms
                .map(Duration::from_millis)
                .unwrap_or(sd.boot_drain),
            join_timeout: self
                .serial
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(sd.join_timeout),
        };

        let rd = ReceiverConfig::default();
        let receiver = ReceiverConfig {
            out_dir: self
                .receiver
                .out_dir
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(rd.out_dir),
            stale_after: self
                .receiver
                .stale_after_s
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(rd.stale_after),
            sweep_interval: self
                .receiver
                .sweep_interval_s
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(rd.sweep_interval),
            temp_text_prefix: non_empty(self.receiver.temp_text_prefix)
                .unwrap_or(rd.temp_text_prefix),
            event_capacity: self
                .receiver
                .event_capacity
                .unwrap_or(rd.event_capacity)
                .max(16),
        };

        let td = TransferConfig::default();
        if self.transfer.chunk_size == Some(0) {
            return Err("transfer.chunk_size must be non-zero".into());
        }
        let backpressure_ratio = self
            .transfer
            .backpressure_ratio
            .unwrap_or(td.backpressure_ratio);
        if !(0.0..=1.0).contains(&backpressure_ratio) {
            return Err(format!(
                "transfer.backpressure_ratio {} outside 0.0..=1.0",
                backpressure_ratio
            ));
        }
        let transfer = TransferConfig {
            chunk_size: self.transfer.chunk_size,
            chunk_timeout: self
                .transfer
                .chunk_timeout_s
                .map(|s| Duration::from_secs(s.max(1))),
            backpressure_ratio,
            single_packet_limit: self
                .transfer
                .single_packet_limit
                .unwrap_or(td.single_packet_limit)
                .max(1),
            mesh_chunk_size: self
                .transfer
                .mesh_chunk_size
                .unwrap_or(td.mesh_chunk_size)
                .max(1),
            mesh_chunk_timeout: self
                .transfer
                .mesh_chunk_timeout_s
                .map(|s| Duration::from_secs(s.max(1)))
                .unwrap_or(td.mesh_chunk_timeout),
            route_timeout: self
                .transfer
                .route_timeout_s
                .map(Duration::from_secs)
                .unwrap_or(td.route_timeout),
            query_window: self
                .transfer
                .query_window_ms
                .map(Duration::from_millis)
                .unwrap_or(td.query_window),
        };

        let md = MediaConfig::default();
        let media = MediaConfig {
            jpeg_quality: self.media.jpeg_quality.unwrap_or(md.jpeg_quality).clamp(1, 100),
            mp3_bitrate: non_empty(self.media.mp3_bitrate).unwrap_or(md.mp3_bitrate),
            ffmpeg: non_empty(self.media.ffmpeg).unwrap_or(md.ffmpeg),
        };

        Ok(LinkConfig {
            version,
            serial,
            receiver,
            transfer,
            media,
        })
    }
}

impl LinkConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(LinkConfig::default());
        }
        let parsed: LinkConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }

    /// Config for a given port with everything else defaulted.
    pub fn for_port(port: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.serial.port = port.into();
        config
    }
}
