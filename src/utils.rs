use std::io;
use std::path::Path;

use tracing::info;
use v4l::capability::Flags;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::error::Error;

// Detected capture device info
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Auto-detect the best capture device under /dev/video*. MJPEG devices win
/// over YUYV since they cost far less USB bandwidth at the same resolution.
pub fn auto_detect_device() -> crate::Result<FoundDevice> {
    info!("auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(Flags::STREAMING)
        {
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"MJPG") {
                info!(%path, card = %caps.card, "found MJPEG device");
                return Ok(FoundDevice {
                    path,
                    format: PixelFormat::Mjpeg,
                });
            } else if fmt.fourcc == FourCC::new(b"YUYV") {
                info!(%path, card = %caps.card, "found YUYV device");
                return Ok(FoundDevice {
                    path,
                    format: PixelFormat::Yuyv,
                });
            }
        }
    }

    Err(Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        "no suitable capture device found",
    )))
}
