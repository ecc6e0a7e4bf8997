//! V4L2 device binding: open/format/stream lifecycle and frame acquisition

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{info, warn};
use v4l::capability::Flags as CapFlags;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::pool::BufferPool;
use crate::error::{CaptureError, DeviceError};
use crate::{AcquirePolicy, CameraConfig};

/// Format actually granted by the driver. May differ from the request;
/// everything downstream must use these values.
#[derive(Debug, Clone, Copy)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub pixel: PixelFormat,
}

/// One open camera device plus its buffer pool.
///
/// `initialize` drives the device from closed through format negotiation,
/// buffer mapping and (for the continuous policy) streaming. Any failure on
/// the way up unwinds through `Drop`, leaving nothing half-open behind.
pub struct VideoDevice {
    device: Device,
    pool: Arc<BufferPool>,
    format: NegotiatedFormat,
    policy: AcquirePolicy,
    sequence: u64,
    closed: bool,
}

impl VideoDevice {
    pub fn initialize(config: &CameraConfig) -> Result<Self, DeviceError> {
        let device = Device::with_path(&config.device).map_err(|source| DeviceError::Open {
            path: config.device.clone(),
            source,
        })?;

        let caps = device.query_caps().map_err(|source| DeviceError::Ioctl {
            op: "VIDIOC_QUERYCAP",
            source,
        })?;
        info!(device = %config.device, card = %caps.card, driver = %caps.driver, "opened device");
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(CapFlags::STREAMING)
        {
            return Err(DeviceError::Unsupported {
                path: config.device.clone(),
            });
        }

        let mut fmt = device.format().map_err(|source| DeviceError::Ioctl {
            op: "VIDIOC_G_FMT",
            source,
        })?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = config.format.fourcc();
        let actual = device
            .set_format(&fmt)
            .map_err(|_| DeviceError::FormatRejected {
                fourcc: config.format.fourcc().to_string(),
                width: config.width,
                height: config.height,
            })?;

        // The driver may substitute a format we cannot process; dimension
        // adjustments are fine, fourcc substitution is not.
        let pixel = match PixelFormat::from_fourcc(actual.fourcc) {
            Some(pixel) if pixel == config.format => pixel,
            _ => {
                return Err(DeviceError::FormatRejected {
                    fourcc: actual.fourcc.to_string(),
                    width: actual.width,
                    height: actual.height,
                })
            }
        };
        if actual.width != config.width || actual.height != config.height {
            warn!(
                requested_width = config.width,
                requested_height = config.height,
                width = actual.width,
                height = actual.height,
                "driver adjusted resolution"
            );
        }

        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            if let Err(e) = device.set_params(&params) {
                warn!(fps = config.fps, error = %e, "failed to set frame rate");
            }
        }

        let pool = Arc::new(BufferPool::request(
            device.handle(),
            config.buffer_count.max(1),
        )?);

        if config.acquisition == AcquirePolicy::Continuous {
            pool.queue_all()?;
            pool.stream_on()?;
        }

        info!(
            device = %config.device,
            width = actual.width,
            height = actual.height,
            buffers = pool.buffer_count(),
            policy = ?config.acquisition,
            "capture initialized"
        );

        Ok(Self {
            device,
            pool,
            format: NegotiatedFormat {
                width: actual.width,
                height: actual.height,
                pixel,
            },
            policy: config.acquisition,
            sequence: 0,
            closed: false,
        })
    }

    pub fn format(&self) -> NegotiatedFormat {
        self.format
    }

    /// Checked-out frames not yet released back to the pool.
    pub fn outstanding_frames(&self) -> usize {
        self.pool.outstanding()
    }

    /// Wait up to `timeout` for a filled buffer, then hand it out under the
    /// configured policy. `Timeout` (and `Exhausted`, when every buffer is
    /// loaned out) is recoverable; the caller retries.
    pub fn acquire_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        if self.closed {
            return Err(CaptureError::Device(DeviceError::Closed));
        }
        match self.policy {
            AcquirePolicy::Continuous => self.acquire_streaming(timeout),
            AcquirePolicy::OneShot => self.acquire_oneshot(timeout),
        }
    }

    /// Give a borrowed frame back to the device. Kept for call sites that
    /// read better with an explicit device-side release; `Frame::release`
    /// is the same operation.
    pub fn release_frame(&self, frame: Frame) {
        frame.release();
    }

    /// Stop streaming and mark the binding closed. Safe to call repeatedly.
    /// Mappings and the fd are reclaimed once the last outstanding frame
    /// drops its pool reference.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.pool.stream_off() {
            warn!(error = %e, "stream off during close");
        }
        let outstanding = self.pool.outstanding();
        if outstanding != 0 {
            warn!(outstanding, "device closed with frames still checked out");
        }
        info!("device closed");
    }

    fn acquire_streaming(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        self.wait_readable(timeout)?;
        let (filled, token) = self.pool.dequeue()?;
        self.sequence += 1;

        let meta = Arc::new(FrameMetadata {
            sequence: self.sequence,
            width: self.format.width,
            height: self.format.height,
            format: self.format.pixel,
            device_timestamp: Some(filled.timestamp),
        });
        let len = self.pool.plane_view_len(filled.index, filled.bytesused);
        let ptr = self.pool.plane_ptr(filled.index);
        Ok(Frame::borrowed(self.pool.clone(), token, ptr, len, meta))
    }

    /// Spin the stream up for a single frame and copy it out. The returned
    /// frame owns its bytes, so there is nothing to release afterwards.
    fn acquire_oneshot(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        self.pool.queue(0)?;
        self.pool.stream_on()?;

        let shot = self.wait_readable(timeout).and_then(|()| {
            let (filled, token) = self.pool.dequeue()?;
            self.sequence += 1;

            let meta = Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: self.format.width,
                height: self.format.height,
                format: self.format.pixel,
                device_timestamp: Some(filled.timestamp),
            });
            let len = self.pool.plane_view_len(filled.index, filled.bytesused);
            let ptr = self.pool.plane_ptr(filled.index);
            // SAFETY: the token pins this checkout until the discard below,
            // so the mapping cannot be handed out while we copy.
            let bytes = Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(ptr, len) });
            self.pool.discard(token);
            Ok(Frame::owned(bytes, meta))
        });

        // Always wind the stream back down, success or not; this also
        // returns any still-queued buffer to the unqueued state.
        if let Err(e) = self.pool.stream_off() {
            warn!(error = %e, "stream off after one-shot capture");
        }
        shot
    }

    fn wait_readable(&self, timeout: Duration) -> Result<(), CaptureError> {
        let fd = self.device.handle().fd();
        // SAFETY: the fd stays open for the lifetime of `self.device`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

        loop {
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => return Err(CaptureError::Timeout),
                Ok(_) => {
                    let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                    if revents.contains(PollFlags::POLLERR) {
                        // POLLERR with every buffer loaned out just means
                        // the kernel has nothing queued; callers back off
                        // until a frame is released.
                        if self.pool.outstanding() == self.pool.buffer_count() {
                            return Err(CaptureError::Exhausted);
                        }
                        return Err(CaptureError::Device(DeviceError::Ioctl {
                            op: "poll",
                            source: io::Error::other("POLLERR on capture fd"),
                        }));
                    }
                    return Ok(());
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(CaptureError::Device(DeviceError::Ioctl {
                        op: "poll",
                        source: errno.into(),
                    }))
                }
            }
        }
    }
}

impl Drop for VideoDevice {
    fn drop(&mut self) {
        self.close();
    }
}
