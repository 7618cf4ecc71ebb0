//! # Media Preparation
//!
//! Turns a source file into the bytes actually transmitted. Images are
//! re-encoded as JPEG and audio as MP3 (through an external `ffmpeg`);
//! everything else, including files already in those formats, goes out as
//! raw bytes.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::error::MediaError;
use crate::policy::ContentCategory;

const TEXT_EXT: &[&str] = &["txt", "csv", "json", "text"];
const IMAGE_EXT: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp"];
const AUDIO_EXT: &[&str] = &["wav", "flac", "mp3", "m4a", "aac", "ogg", "wma", "aif", "aiff"];

/// Transmission-ready content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMedia {
    pub bytes: Vec<u8>,
    /// Name to put on the wire; the extension reflects any conversion.
    pub transmit_name: String,
    /// Human-readable note such as `image->jpeg, 5321 bytes`.
    pub description: String,
    pub category: ContentCategory,
}

/// Byte-in/byte-out conversion applied before a transfer.
pub trait MediaPreparer {
    fn prepare(&self, path: &Path) -> Result<PreparedMedia, MediaError>;
}

/// Coarse media kind by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Text,
    Image,
    Audio,
    Other,
}

impl MediaKind {
    pub fn of(path: &Path) -> Self {
        let ext = extension(path);
        let ext = ext.as_str();
        if TEXT_EXT.contains(&ext) {
            MediaKind::Text
        } else if IMAGE_EXT.contains(&ext) {
            MediaKind::Image
        } else if AUDIO_EXT.contains(&ext) {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}

fn renamed(path: &Path, ext: &str) -> String {
    file_name(&path.with_extension(ext))
}

fn read(path: &Path) -> Result<Vec<u8>, MediaError> {
    fs::read(path).map_err(|source| MediaError::Read {
        path: path.display().to_string(),
        source,
    })
}

// ─── Raw ────────────────────────────────────────────────────────────────────

/// Sends files exactly as they are on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPreparer;

impl MediaPreparer for RawPreparer {
    fn prepare(&self, path: &Path) -> Result<PreparedMedia, MediaError> {
        let bytes = read(path)?;
        Ok(PreparedMedia {
            description: format!("raw bytes, {} bytes", bytes.len()),
            transmit_name: file_name(path),
            category: ContentCategory::from_path(path),
            bytes,
        })
    }
}

// ─── Default ────────────────────────────────────────────────────────────────

/// Image → JPEG, audio → MP3, everything else raw.
#[derive(Debug, Clone)]
pub struct DefaultPreparer {
    jpeg_quality: u8,
    mp3_bitrate: String,
    ffmpeg: String,
}

impl DefaultPreparer {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
            mp3_bitrate: config.mp3_bitrate.clone(),
            ffmpeg: config.ffmpeg.clone(),
        }
    }

    fn to_jpeg(&self, path: &Path) -> Result<PreparedMedia, MediaError> {
        info!(file = %path.display(), quality = self.jpeg_quality, "converting image to JPEG");
        let image = image::open(path)?;
        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
        let mut bytes = Vec::new();
        rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality))?;
        Ok(PreparedMedia {
            description: format!("image->jpeg, {} bytes", bytes.len()),
            transmit_name: renamed(path, "jpg"),
            category: ContentCategory::Image,
            bytes,
        })
    }

    fn to_mp3(&self, path: &Path) -> Result<PreparedMedia, MediaError> {
        info!(file = %path.display(), bitrate = %self.mp3_bitrate, "converting audio to MP3");
        let output = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(["-vn", "-b:a", self.mp3_bitrate.as_str(), "-f", "mp3", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                MediaError::Ffmpeg(format!(
                    "failed to start {}: {e} (is ffmpeg installed?)",
                    self.ffmpeg
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MediaError::Ffmpeg(format!(
                "{} exited with {}: {}",
                self.ffmpeg,
                output.status,
                stderr.trim()
            )));
        }
        let bytes = output.stdout;
        Ok(PreparedMedia {
            description: format!("audio->mp3, {} bytes", bytes.len()),
            transmit_name: renamed(path, "mp3"),
            category: ContentCategory::Voice,
            bytes,
        })
    }
}

impl Default for DefaultPreparer {
    fn default() -> Self {
        Self::new(&MediaConfig::default())
    }
}

impl MediaPreparer for DefaultPreparer {
    fn prepare(&self, path: &Path) -> Result<PreparedMedia, MediaError> {
        let ext = extension(path);
        match MediaKind::of(path) {
            MediaKind::Image if ext != "jpg" && ext != "jpeg" => self.to_jpeg(path),
            MediaKind::Audio if ext != "mp3" => self.to_mp3(path),
            kind => {
                debug!(file = %path.display(), ?kind, "sending without conversion");
                RawPreparer.prepare(path)
            }
        }
    }
}
