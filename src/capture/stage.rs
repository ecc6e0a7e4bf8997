//! Capture pipeline stage: runs acquisition on its own thread and feeds a
//! bounded drop-oldest queue, decoupling the camera rate from the consumer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::device::VideoDevice;
use crate::capture::frame::Frame;
use crate::error::CaptureError;
use crate::pipeline::queue::{BoundedQueue, Popped};

/// How long one acquisition attempt may wait for device readiness
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause before retrying after a failed acquisition
const RETRY_BACKOFF: Duration = Duration::from_millis(5);
/// Consecutive fatal errors tolerated before the stage gives up
const MAX_CONSECUTIVE_FAULTS: u32 = 10;
/// Minimum spacing between queue-overflow log lines
const DROP_LOG_THROTTLE: Duration = Duration::from_secs(5);

/// Anything that can produce frames for a capture stage. The production
/// implementation is [`VideoDevice`]; tests plug in synthetic sources.
pub trait FrameSource: Send + 'static {
    fn acquire(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// Called once after the stage has drained its queue.
    fn shutdown(&mut self) {}
}

impl FrameSource for VideoDevice {
    fn acquire(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        self.acquire_frame(timeout)
    }

    fn shutdown(&mut self) {
        self.close();
    }
}

/// Consumer handle onto a capture stage's queue; this is what the
/// transform thread holds so it never touches the stage's lifecycle.
pub struct FrameReceiver {
    queue: Arc<BoundedQueue<Frame>>,
}

impl FrameReceiver {
    /// Block until a frame arrives or the stage is stopped and drained.
    /// `wait_step` bounds each wait on the queue, not the total wait, so a
    /// caller always notices a stop within one step.
    pub fn get_frame(&self, wait_step: Duration) -> Option<Frame> {
        loop {
            match self.queue.pop_timeout(wait_step) {
                Popped::Item(frame) => return Some(frame),
                Popped::Empty => continue,
                Popped::Stopped => return None,
            }
        }
    }

    /// Queue counters: (captured, delivered, dropped).
    pub fn stats(&self) -> (usize, usize, usize) {
        self.queue.stats()
    }
}

/// A capture thread plus the queue it fills.
pub struct CaptureStage<S: FrameSource> {
    source: Arc<Mutex<S>>,
    queue: Arc<BoundedQueue<Frame>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    faults: flume::Receiver<CaptureError>,
}

impl<S: FrameSource> CaptureStage<S> {
    /// Spawn the capture thread. `label` names the thread for logs.
    pub fn start(source: S, queue_capacity: usize, label: &str) -> io::Result<Self> {
        let source = Arc::new(Mutex::new(source));
        let queue = Arc::new(BoundedQueue::new(queue_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let (fault_tx, faults) = flume::bounded(1);

        let worker = {
            let source = source.clone();
            let queue = queue.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("capture-{label}"))
                .spawn(move || capture_loop(source, queue, running, fault_tx))?
        };

        Ok(Self {
            source,
            queue,
            running,
            worker: Some(worker),
            faults,
        })
    }

    /// Block until a frame arrives or the stage is stopped and drained.
    /// See [`FrameReceiver::get_frame`].
    pub fn get_frame(&self, wait_step: Duration) -> Option<Frame> {
        self.frames().get_frame(wait_step)
    }

    /// A detached consumer handle for the thread doing the transform work.
    pub fn frames(&self) -> FrameReceiver {
        FrameReceiver {
            queue: self.queue.clone(),
        }
    }

    /// Whether the capture loop is still producing.
    pub fn is_running(&self) -> bool {
        !self.queue.is_stopped()
    }

    /// The fatal error that stopped the loop, if one did.
    pub fn fault(&self) -> Option<CaptureError> {
        self.faults.try_recv().ok()
    }

    /// Stop the capture thread, drain the queue (releasing any borrowed
    /// kernel buffers), then shut the source down. The device is only
    /// closed after every queued frame has been released.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.running.store(false, Ordering::Release);
        self.queue.stop();
        if worker.join().is_err() {
            error!("capture thread panicked");
        }

        let leftover = self.queue.drain();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "released undelivered frames");
        }
        drop(leftover);

        self.source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .shutdown();
    }
}

impl<S: FrameSource> Drop for CaptureStage<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop<S: FrameSource>(
    source: Arc<Mutex<S>>,
    queue: Arc<BoundedQueue<Frame>>,
    running: Arc<AtomicBool>,
    fault_tx: flume::Sender<CaptureError>,
) {
    info!("capture loop started");
    let mut consecutive_faults = 0u32;
    let mut last_drop_log: Option<Instant> = None;

    while running.load(Ordering::Acquire) {
        let acquired = source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .acquire(ACQUIRE_TIMEOUT);

        match acquired {
            Ok(frame) => {
                consecutive_faults = 0;
                metrics::counter!("capture_frames_total").increment(1);
                if let Some(evicted) = queue.push(frame) {
                    metrics::counter!("capture_frames_dropped").increment(1);
                    // Dropping the evicted frame releases its kernel buffer.
                    drop(evicted);
                    let due = last_drop_log
                        .map(|t| t.elapsed() >= DROP_LOG_THROTTLE)
                        .unwrap_or(true);
                    if due {
                        let (_, _, dropped) = queue.stats();
                        debug!(dropped, "capture queue full; evicting oldest frames");
                        last_drop_log = Some(Instant::now());
                    }
                }
            }
            Err(e) if e.is_recoverable() => {
                thread::sleep(RETRY_BACKOFF);
            }
            Err(e) => {
                consecutive_faults += 1;
                warn!(error = %e, consecutive_faults, "frame acquisition failed");
                if consecutive_faults >= MAX_CONSECUTIVE_FAULTS {
                    error!(error = %e, "device unusable; stopping capture loop");
                    let _ = fault_tx.try_send(e);
                    break;
                }
                thread::sleep(RETRY_BACKOFF);
            }
        }
    }

    queue.stop();
    info!("capture loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::tests::{borrowed_frame, MockReclaim};
    use crate::error::DeviceError;

    /// Produces borrowed frames against a mock pool as fast as it is asked.
    struct SyntheticSource {
        pool: Arc<MockReclaim>,
        produced: Arc<std::sync::atomic::AtomicUsize>,
        shut_down: Arc<AtomicBool>,
    }

    impl FrameSource for SyntheticSource {
        fn acquire(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
            let n = self.produced.fetch_add(1, Ordering::SeqCst);
            // Tiny sleep keeps the test from spinning a core flat out.
            thread::sleep(Duration::from_millis(1));
            Ok(borrowed_frame(self.pool.clone(), n as u32))
        }

        fn shutdown(&mut self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    struct BrokenSource;

    impl FrameSource for BrokenSource {
        fn acquire(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
            Err(CaptureError::Device(DeviceError::Closed))
        }
    }

    #[test]
    fn frames_flow_and_shutdown_releases_every_checkout() {
        let pool = MockReclaim::new();
        let produced = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let shut_down = Arc::new(AtomicBool::new(false));
        let source = SyntheticSource {
            pool: pool.clone(),
            produced: produced.clone(),
            shut_down: shut_down.clone(),
        };

        let mut stage = CaptureStage::start(source, 1, "test").unwrap();
        let frame = stage
            .get_frame(Duration::from_millis(50))
            .expect("a frame should arrive");
        drop(frame);

        stage.stop();
        assert!(shut_down.load(Ordering::SeqCst), "source must be shut down");
        assert!(stage.get_frame(Duration::from_millis(1)).is_none());

        // Every checkout the source handed out must have been given back:
        // consumed, evicted, or drained at stop.
        assert_eq!(pool.count(), produced.load(Ordering::SeqCst));
    }

    #[test]
    fn repeated_fatal_errors_stop_the_stage_and_surface_a_fault() {
        let mut stage = CaptureStage::start(BrokenSource, 2, "broken").unwrap();

        // None here means the queue stopped on its own; the loop gave up
        // after its bounded run of consecutive failures.
        assert!(stage.get_frame(Duration::from_millis(20)).is_none());
        assert!(!stage.is_running());
        assert!(matches!(
            stage.fault(),
            Some(CaptureError::Device(DeviceError::Closed))
        ));
        stage.stop();
    }
}
