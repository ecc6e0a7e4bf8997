//! Frame views over captured image data
//!
//! A frame either borrows one of the device's kernel-mapped buffers (and must
//! give it back exactly once) or owns a private copy. The borrowed variant
//! carries a [`CheckoutToken`] that is surrendered on release, so a second
//! release cannot be expressed.

use std::fmt;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use v4l::FourCC;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
    Rgb24,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"RGB3" => Some(PixelFormat::Rgb24),
            _ => None,
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Hardware timestamp if the driver provides one
    pub device_timestamp: Option<Duration>,
}

/// Proof of one live buffer checkout: queue index plus the generation the
/// ledger stamped at dequeue time. Deliberately neither `Clone` nor `Copy`;
/// giving it back is the only way to let the pool reuse the buffer.
pub struct CheckoutToken {
    pub(crate) index: u32,
    pub(crate) generation: u64,
}

impl CheckoutToken {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for CheckoutToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CheckoutToken({}@{})", self.index, self.generation)
    }
}

/// Capability to hand a checked-out buffer back to its pool. Implemented by
/// the buffer pool; tests substitute a recording mock.
pub(crate) trait BufferReclaim: Send + Sync {
    fn reclaim(&self, token: CheckoutToken);
}

enum FrameData {
    /// View into a kernel-mapped buffer, owned by `pool` until reclaimed
    Borrowed {
        pool: Arc<dyn BufferReclaim>,
        token: Option<CheckoutToken>,
        ptr: *const u8,
        len: usize,
    },
    /// Private copy, independent of device state
    Owned(Bytes),
}

/// One captured frame plus its metadata
pub struct Frame {
    data: FrameData,
    pub meta: Arc<FrameMetadata>,
}

// SAFETY: the Borrowed pointer aliases a mapping kept alive by the Arc'd
// pool, and the checkout ledger guarantees at most one live view per buffer
// index, so moving the view to another thread cannot race the kernel.
unsafe impl Send for Frame {}

impl Frame {
    pub(crate) fn borrowed(
        pool: Arc<dyn BufferReclaim>,
        token: CheckoutToken,
        ptr: *const u8,
        len: usize,
        meta: Arc<FrameMetadata>,
    ) -> Self {
        Self {
            data: FrameData::Borrowed {
                pool,
                token: Some(token),
                ptr,
                len,
            },
            meta,
        }
    }

    pub fn owned(bytes: Bytes, meta: Arc<FrameMetadata>) -> Self {
        Self {
            data: FrameData::Owned(bytes),
            meta,
        }
    }

    /// The valid bytes of this frame (`bytesused`, not the full buffer).
    pub fn data(&self) -> &[u8] {
        match &self.data {
            FrameData::Borrowed { token, ptr, len, .. } => match token {
                // SAFETY: token proves the checkout is live; see Send impl.
                Some(_) => unsafe { slice::from_raw_parts(*ptr, *len) },
                None => &[],
            },
            FrameData::Owned(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.data, FrameData::Borrowed { .. })
    }

    /// Give a borrowed buffer back to its pool. Consumes the frame, so the
    /// view cannot outlive the release; a no-op for owned frames.
    pub fn release(self) {
        // Drop does the work; spelled out so call sites read as a release.
        drop(self);
    }

    fn reclaim_if_borrowed(&mut self) {
        if let FrameData::Borrowed { pool, token, .. } = &mut self.data {
            if let Some(token) = token.take() {
                pool.reclaim(token);
            }
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.reclaim_if_borrowed();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len())
            .field("borrowed", &self.is_borrowed())
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records reclaimed tokens in place of a real buffer pool.
    pub(crate) struct MockReclaim {
        pub(crate) reclaimed: Mutex<Vec<(u32, u64)>>,
    }

    impl MockReclaim {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                reclaimed: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn count(&self) -> usize {
            self.reclaimed.lock().unwrap().len()
        }
    }

    impl BufferReclaim for MockReclaim {
        fn reclaim(&self, token: CheckoutToken) {
            self.reclaimed
                .lock()
                .unwrap()
                .push((token.index, token.generation));
        }
    }

    pub(crate) fn test_meta(width: u32, height: u32) -> Arc<FrameMetadata> {
        Arc::new(FrameMetadata {
            sequence: 0,
            width,
            height,
            format: PixelFormat::Yuyv,
            device_timestamp: None,
        })
    }

    pub(crate) fn borrowed_frame(pool: Arc<MockReclaim>, index: u32) -> Frame {
        static BACKING: [u8; 16] = [0xAB; 16];
        Frame::borrowed(
            pool,
            CheckoutToken {
                index,
                generation: 1,
            },
            BACKING.as_ptr(),
            BACKING.len(),
            test_meta(4, 2),
        )
    }

    #[test]
    fn drop_reclaims_exactly_once() {
        let pool = MockReclaim::new();
        let frame = borrowed_frame(pool.clone(), 3);
        assert_eq!(frame.data().len(), 16);
        drop(frame);
        assert_eq!(&*pool.reclaimed.lock().unwrap(), &[(3, 1)]);
    }

    #[test]
    fn explicit_release_reclaims_exactly_once() {
        let pool = MockReclaim::new();
        let frame = borrowed_frame(pool.clone(), 0);
        frame.release();
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn owned_frames_never_touch_the_pool() {
        let frame = Frame::owned(Bytes::from_static(b"jpeg"), test_meta(1, 1));
        assert!(!frame.is_borrowed());
        assert_eq!(frame.data(), b"jpeg");
        frame.release();
    }

    #[test]
    fn fourcc_round_trip() {
        for format in [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::Rgb24] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }
}
