//! Error types for the streaming pipeline

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while binding or driving a V4L2 device. All of these are
/// fatal for the pipeline that owns the device.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("{path} is not a streaming capture device")]
    Unsupported { path: String },

    #[error("device rejected format {fourcc} ({width}x{height})")]
    FormatRejected {
        fourcc: String,
        width: u32,
        height: u32,
    },

    #[error("buffer request failed: {0}")]
    BufferRequest(std::io::Error),

    #[error("buffer mapping failed: {0}")]
    BufferMap(std::io::Error),

    #[error("{op} failed: {source}")]
    Ioctl {
        op: &'static str,
        source: std::io::Error,
    },

    #[error("buffer state violation: {0}")]
    BufferState(String),

    #[error("device is closed")]
    Closed,
}

/// Errors raised while acquiring frames. `Timeout` is recoverable and the
/// caller is expected to retry; the rest end the capture loop.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("no kernel buffers available; all checked out")]
    Exhausted,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl CaptureError {
    /// Recoverable conditions are retried in place by the capture loop.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CaptureError::Timeout | CaptureError::Exhausted)
    }
}

/// Per-frame transform failures. The pipeline skips the frame and continues.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("frame data truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unsupported pixel layout: {0}")]
    Unsupported(String),

    #[error("invalid JPEG quality {0} (must be 1..=100)")]
    InvalidQuality(u8),

    #[error("JPEG decode failed: {0}")]
    Decode(#[from] jpeg_decoder::Error),

    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Datagram transport failures. `Backpressure` means the bounded retry was
/// exhausted and the remainder of the packet was dropped on purpose.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("send buffer full after {attempts} attempts; dropped packet at chunk {sent}/{total}")]
    Backpressure {
        attempts: u32,
        sent: usize,
        total: usize,
    },

    #[error("short datagram send: wrote {written} of {expected} bytes")]
    ShortSend { written: usize, expected: usize },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
