//! Kernel buffer pool: REQBUFS/QUERYBUF/mmap arena plus the checkout ledger
//!
//! The pool owns a fixed set of memory-mapped V4L2 buffers and enforces the
//! ownership protocol: a buffer is either queued with the kernel or checked
//! out to exactly one live [`Frame`](super::frame::Frame). Checkouts are
//! stamped with a generation counter so a stale token can never free a
//! buffer that has since been handed out again.

use std::io;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

use crate::capture::frame::{BufferReclaim, CheckoutToken};
use crate::error::DeviceError;

/// Run an ioctl, retrying on EINTR the way the kernel docs ask for.
fn retry_ioctl(
    op: &'static str,
    mut ioctl: impl FnMut() -> io::Result<()>,
) -> Result<(), DeviceError> {
    loop {
        match ioctl() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(DeviceError::Ioctl { op, source }),
        }
    }
}

fn zeroed_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: v4l2_buffer is a plain C struct; zero is a valid state.
        ..unsafe { std::mem::zeroed() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Owned by the kernel (queued or idle), available for checkout
    Free,
    /// Dequeued and loaned out as a Frame
    CheckedOut,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    generation: u64,
}

/// Tracks which buffer indices are loaned out. Pure bookkeeping, no ioctls,
/// so the invariants are testable without a device.
#[derive(Debug)]
pub(crate) struct CheckoutLedger {
    slots: Vec<Slot>,
}

impl CheckoutLedger {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            slots: vec![
                Slot {
                    state: SlotState::Free,
                    generation: 0,
                };
                count
            ],
        }
    }

    /// Stamp a checkout for `index`. Fails if the index is out of range or
    /// already loaned out; the caller treats that as device-state corruption.
    pub(crate) fn checkout(&mut self, index: u32) -> Result<CheckoutToken, String> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| format!("buffer index {index} out of range"))?;
        if slot.state == SlotState::CheckedOut {
            return Err(format!("buffer {index} dequeued while already checked out"));
        }
        slot.state = SlotState::CheckedOut;
        slot.generation += 1;
        Ok(CheckoutToken {
            index,
            generation: slot.generation,
        })
    }

    /// Return a checkout. `false` means the token was stale (already given
    /// back, or from a superseded generation) and nothing changed.
    pub(crate) fn give_back(&mut self, token: &CheckoutToken) -> bool {
        match self.slots.get_mut(token.index as usize) {
            Some(slot)
                if slot.state == SlotState::CheckedOut
                    && slot.generation == token.generation =>
            {
                slot.state = SlotState::Free;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::CheckedOut)
            .count()
    }
}

/// One mmap'ed kernel buffer
struct MappedPlane {
    map: MmapRaw,
    length: u32,
}

/// Result of a successful DQBUF
pub(crate) struct DequeuedBuffer {
    pub index: u32,
    pub bytesused: u32,
    pub timestamp: Duration,
}

/// Fixed-size arena of kernel-mapped capture buffers bound to one device fd.
pub struct BufferPool {
    handle: Arc<Handle>,
    planes: Vec<MappedPlane>,
    ledger: Mutex<CheckoutLedger>,
    streaming: AtomicBool,
}

impl BufferPool {
    /// Request `count` buffers from the driver and map each one. The driver
    /// may grant fewer than requested; zero is an error. On failure the
    /// partially built pool simply drops, unmapping whatever was mapped.
    pub(crate) fn request(handle: Arc<Handle>, count: u32) -> Result<Self, DeviceError> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct; zero is a valid state.
            ..unsafe { std::mem::zeroed() }
        };
        retry_ioctl("VIDIOC_REQBUFS", || unsafe {
            v4l2::ioctl(
                handle.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )
        })
        .map_err(|e| match e {
            DeviceError::Ioctl { source, .. } => DeviceError::BufferRequest(source),
            other => other,
        })?;

        if req.count == 0 {
            return Err(DeviceError::BufferRequest(io::Error::other(
                "driver granted zero buffers",
            )));
        }
        if req.count != count {
            debug!(requested = count, granted = req.count, "driver adjusted buffer count");
        }

        let mut planes = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut buf = zeroed_buffer(index);
            retry_ioctl("VIDIOC_QUERYBUF", || unsafe {
                v4l2::ioctl(
                    handle.fd(),
                    v4l2::vidioc::VIDIOC_QUERYBUF,
                    &mut buf as *mut _ as *mut c_void,
                )
            })?;

            // SAFETY: `m` is a union; for MMAP buffers the kernel fills `offset`.
            let offset = unsafe { buf.m.offset };
            let map = MmapOptions::new()
                .offset(offset as u64)
                .len(buf.length as usize)
                .map_raw(handle.fd())
                .map_err(DeviceError::BufferMap)?;
            planes.push(MappedPlane {
                map,
                length: buf.length,
            });
        }

        let ledger = Mutex::new(CheckoutLedger::new(planes.len()));
        Ok(Self {
            handle,
            planes,
            ledger,
            streaming: AtomicBool::new(false),
        })
    }

    pub(crate) fn buffer_count(&self) -> usize {
        self.planes.len()
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Checked-out buffers that have not been given back yet.
    pub(crate) fn outstanding(&self) -> usize {
        self.lock_ledger().outstanding()
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, CheckoutLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand a buffer to the kernel's incoming queue.
    pub(crate) fn queue(&self, index: u32) -> Result<(), DeviceError> {
        let mut buf = zeroed_buffer(index);
        retry_ioctl("VIDIOC_QBUF", || unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        })
    }

    pub(crate) fn queue_all(&self) -> Result<(), DeviceError> {
        for index in 0..self.planes.len() as u32 {
            self.queue(index)?;
        }
        Ok(())
    }

    /// Take one filled buffer off the kernel's outgoing queue and stamp the
    /// checkout. The caller must already have established readiness.
    pub(crate) fn dequeue(&self) -> Result<(DequeuedBuffer, CheckoutToken), DeviceError> {
        let mut buf = zeroed_buffer(0);
        retry_ioctl("VIDIOC_DQBUF", || unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_DQBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        })?;

        let token = self
            .lock_ledger()
            .checkout(buf.index)
            .map_err(DeviceError::BufferState)?;

        let timestamp = Duration::from_secs(buf.timestamp.tv_sec as u64)
            + Duration::from_micros(buf.timestamp.tv_usec as u64);
        Ok((
            DequeuedBuffer {
                index: buf.index,
                bytesused: buf.bytesused,
                timestamp,
            },
            token,
        ))
    }

    /// Mark a checkout free without requeueing (one-shot copies and
    /// shutdown paths, where the kernel queue is being torn down anyway).
    pub(crate) fn discard(&self, token: CheckoutToken) {
        if !self.lock_ledger().give_back(&token) {
            warn!(?token, "stale buffer token discarded");
        }
    }

    pub(crate) fn stream_on(&self) -> Result<(), DeviceError> {
        let mut kind = Type::VideoCapture as u32;
        retry_ioctl("VIDIOC_STREAMON", || unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_STREAMON,
                &mut kind as *mut _ as *mut c_void,
            )
        })?;
        self.streaming.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the stream. Idempotent; outstanding checkouts stay valid and are
    /// simply marked free on release instead of being requeued.
    pub(crate) fn stream_off(&self) -> Result<(), DeviceError> {
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut kind = Type::VideoCapture as u32;
        retry_ioctl("VIDIOC_STREAMOFF", || unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_STREAMOFF,
                &mut kind as *mut _ as *mut c_void,
            )
        })
    }

    /// Base pointer of a mapped plane. The checkout ledger guards aliasing;
    /// callers only pair this with a live token for the same index.
    pub(crate) fn plane_ptr(&self, index: u32) -> *const u8 {
        self.planes[index as usize].map.as_ptr() as *const u8
    }

    /// Clamp the driver-reported payload length to the mapped size.
    pub(crate) fn plane_view_len(&self, index: u32, bytesused: u32) -> usize {
        bytesused.min(self.planes[index as usize].length) as usize
    }
}

impl BufferReclaim for BufferPool {
    fn reclaim(&self, token: CheckoutToken) {
        let index = token.index;
        if !self.lock_ledger().give_back(&token) {
            warn!(?token, "stale buffer token ignored");
            return;
        }
        if self.is_streaming() {
            if let Err(e) = self.queue(index) {
                warn!(index, error = %e, "failed to requeue released buffer");
            }
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding != 0 {
            warn!(outstanding, "buffer pool dropped with live checkouts");
        }
        if let Err(e) = self.stream_off() {
            debug!(error = %e, "stream off during pool teardown");
        }
        // Unmap before releasing the kernel-side buffers.
        self.planes.clear();
        let mut req = v4l2_requestbuffers {
            count: 0,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct; zero is a valid state.
            ..unsafe { std::mem::zeroed() }
        };
        let _ = retry_ioctl("VIDIOC_REQBUFS", || unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_and_give_back_cycle() {
        let mut ledger = CheckoutLedger::new(2);
        let token = ledger.checkout(0).unwrap();
        assert_eq!(ledger.outstanding(), 1);
        assert!(ledger.give_back(&token));
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn double_give_back_is_a_no_op() {
        let mut ledger = CheckoutLedger::new(1);
        let token = ledger.checkout(0).unwrap();
        assert!(ledger.give_back(&token));
        assert!(!ledger.give_back(&token));
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn live_index_cannot_be_checked_out_twice() {
        let mut ledger = CheckoutLedger::new(2);
        let _t0 = ledger.checkout(0).unwrap();
        let _t1 = ledger.checkout(1).unwrap();
        // Pool of two, both loaned out: a third checkout of a live index
        // must fail cleanly rather than aliasing a buffer.
        assert!(ledger.checkout(0).is_err());
        assert!(ledger.checkout(1).is_err());
        assert_eq!(ledger.outstanding(), 2);
    }

    #[test]
    fn stale_generation_cannot_free_a_reissued_buffer() {
        let mut ledger = CheckoutLedger::new(1);
        let old = ledger.checkout(0).unwrap();
        assert!(ledger.give_back(&old));

        // Same index goes out again under a new generation.
        let fresh = ledger.checkout(0).unwrap();
        assert!(!ledger.give_back(&old), "stale token must be rejected");
        assert_eq!(ledger.outstanding(), 1);
        assert!(ledger.give_back(&fresh));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut ledger = CheckoutLedger::new(1);
        assert!(ledger.checkout(5).is_err());
    }
}
