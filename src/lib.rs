pub mod capture;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod transform;
pub mod utils;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

/// Global configuration, stored once at startup
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub cameras: Vec<CameraConfig>,
    pub transform: TransformConfig,
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Destination IPv4 address shared by every camera stream
    pub dest_ip: String,
    /// Requested kernel send buffer size; enlarging is best-effort
    pub send_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device node path; empty string triggers auto-detection
    pub device: String,
    /// Destination UDP port for this camera's stream
    pub port: u16,
    pub width: u32,
    pub height: u32,
    /// Frame budget for the transform loop; 0 disables pacing
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub acquisition: AcquirePolicy,
}

/// How frames are pulled off the device.
///
/// `Continuous` keeps the device streaming and loans out kernel buffers
/// (lowest latency, constant bus bandwidth). `OneShot` spins the stream up
/// per frame and copies the data out (higher latency, near-zero idle
/// bandwidth, useful when device count exceeds bus capacity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquirePolicy {
    Continuous,
    OneShot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub jpeg_quality: u8,
    /// Downscale frames to this width before encoding; None keeps native size
    pub target_width: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture queue depth per camera; oldest frames are evicted when full
    pub capture_queue_capacity: usize,
    /// Send queue depth; 1 means "always send the newest frame"
    pub send_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Datagram payload size, excluding the one-byte chunk flag
    pub chunk_payload: usize,
    /// Attempts per chunk before the rest of the packet is dropped
    pub retry_limit: u32,
    /// Sleep between retry attempts, in microseconds
    pub retry_backoff_us: u64,
    /// Sleep briefly after every N chunks; 0 disables pacing
    pub pace_every: usize,
    /// Pacing sleep duration, in microseconds
    pub pace_sleep_us: u64,
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file is absent. Settings are read once at startup; nothing
    /// re-reads them at runtime.
    pub fn load(path: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            cameras: vec![CameraConfig::default()],
            transform: TransformConfig::default(),
            pipeline: PipelineConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dest_ip: "127.0.0.1".into(),
            send_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            port: 50000,
            width: 800,
            height: 600,
            fps: 4,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
            acquisition: AcquirePolicy::Continuous,
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            target_width: Some(640),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capture_queue_capacity: 2,
            send_queue_capacity: 1,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_payload: 1400,
            retry_limit: 5,
            retry_backoff_us: 500,
            pace_every: 0,
            pace_sleep_us: 200,
        }
    }
}
