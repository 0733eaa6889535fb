//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Hardware acceleration selection.
    pub hardware: HardwareConfig,

    /// Output encoder defaults.
    pub encoder: EncoderDefaults,

    /// Source decoder defaults.
    pub decoder: DecoderDefaults,

    /// Bounded drain/flush budgets for asynchronous encoding and teardown.
    pub drain: DrainPolicy,

    /// CPU frame pool sizing.
    pub pool: PoolConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Hardware acceleration selection as exposed to the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Backend name: "auto", "none", "cuda", "vaapi", or "videotoolbox".
    pub backend: String,

    /// Zero-based device index on the selected backend.
    pub device_index: u32,

    /// Allow hardware decoding.
    pub decode: bool,

    /// Allow hardware encoding.
    pub encode: bool,
}

/// Default encoder parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderDefaults {
    /// Codec family: "h264", "hevc", or "av1".
    pub codec: String,

    /// Target bitrate. Takes precedence over `quality` when set.
    pub bitrate_kbps: Option<u32>,

    /// Constant-quality factor (CRF/CQ), used when no bitrate is set.
    pub quality: Option<u32>,

    /// Encoder preset string, passed through to the codec session.
    pub preset: Option<String>,

    /// Group-of-pictures size in frames.
    pub gop_size: u32,

    /// Codec thread count (0 = auto).
    pub threads: u32,
}

/// Default decoder parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderDefaults {
    /// Forward distance (in frames) still served by sequential decode
    /// instead of a container seek.
    pub seek_threshold_frames: u64,

    /// CPU pixel format produced by `get_frame`.
    pub output_format: String,

    /// Codec thread count (0 = auto).
    pub threads: u32,
}

/// Retry and budget policy for draining hardware sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainPolicy {
    /// Attempts to pull outstanding packets before sending end-of-stream.
    pub max_drain_attempts: u32,

    /// Sleep between drain attempts that produced nothing.
    pub drain_backoff_ms: u64,

    /// Upper bound on receive iterations after end-of-stream was sent.
    pub max_flush_iterations: u32,

    /// Delay between stopping a hardware session and releasing its memory.
    pub teardown_delay_ms: u64,

    /// Queue size assumed when a codec does not report one.
    pub queue_capacity: u32,
}

/// CPU frame pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers kept per (width, height, format) before growth is reported.
    pub soft_limit: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "cutline_media=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,

    /// Optional log file path.
    pub file: Option<PathBuf>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            backend: "auto".to_string(),
            device_index: 0,
            decode: true,
            encode: true,
        }
    }
}

impl Default for EncoderDefaults {
    fn default() -> Self {
        Self {
            codec: "h264".to_string(),
            bitrate_kbps: None,
            quality: None,
            preset: None,
            gop_size: 60,
            threads: 0,
        }
    }
}

impl Default for DecoderDefaults {
    fn default() -> Self {
        Self {
            seek_threshold_frames: 60,
            output_format: "yuv420p".to_string(),
            threads: 0,
        }
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            max_drain_attempts: 100,
            drain_backoff_ms: 1,
            max_flush_iterations: 1000,
            teardown_delay_ms: 100,
            queue_capacity: 16,
        }
    }
}

impl DrainPolicy {
    /// A policy with zero sleeps, for tests and synthetic backends.
    pub fn immediate() -> Self {
        Self {
            drain_backoff_ms: 0,
            teardown_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn drain_backoff(&self) -> Duration {
        Duration::from_millis(self.drain_backoff_ms)
    }

    pub fn teardown_delay(&self) -> Duration {
        Duration::from_millis(self.teardown_delay_ms)
    }

    /// In-flight count at which the encoder drains before sending more.
    pub fn proactive_drain_threshold(&self, codec_capacity: Option<u32>) -> u64 {
        let capacity = codec_capacity.unwrap_or(self.queue_capacity).max(3);
        u64::from(capacity - 2)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { soft_limit: 8 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("cutline").join("config.json")
}
