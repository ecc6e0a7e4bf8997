//! Pipeline plumbing: the shared bounded queue and per-camera orchestration

pub mod queue;

use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::capture::device::VideoDevice;
use crate::capture::stage::{CaptureStage, FrameReceiver};
use crate::error::Error;
use crate::net::stage::{PacketSender, SendStage};
use crate::net::transport::{ChunkSender, UdpSink};
use crate::transform::JpegTransform;
use crate::utils;
use crate::{CameraConfig, Config};

pub use queue::BoundedQueue;

/// Wait step for the transform thread's frame waits
const GET_FRAME_STEP: Duration = Duration::from_millis(250);
/// Spacing of the periodic throughput log line
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// One camera's capture → transform → send chain.
///
/// `spawn` brings the whole chain up (any failure is fatal and unwinds);
/// `stop` tears it down in order: capture stops and drains first, the
/// device closes, then the sender goes away.
pub struct CameraPipeline {
    label: String,
    capture: CaptureStage<VideoDevice>,
    sender: SendStage,
    worker: Option<JoinHandle<()>>,
}

impl CameraPipeline {
    pub fn spawn(index: usize, camera: &CameraConfig, config: &Config) -> Result<Self, Error> {
        let label = format!("cam{index}");
        let mut camera = camera.clone();
        if camera.device.is_empty() {
            let found = utils::auto_detect_device()?;
            info!(path = %found.path, format = ?found.format, "auto-detected capture device");
            camera.device = found.path;
            camera.format = found.format;
        }

        let device = VideoDevice::initialize(&camera)?;
        let negotiated = device.format();
        let capture = CaptureStage::start(
            device,
            config.pipeline.capture_queue_capacity,
            &label,
        )
        .map_err(Error::Io)?;

        let peer: SocketAddr = format!("{}:{}", config.network.dest_ip, camera.port)
            .parse()
            .map_err(|e| {
                Error::Config(config::ConfigError::Message(format!(
                    "invalid destination {}:{}: {e}",
                    config.network.dest_ip, camera.port
                )))
            })?;
        let sink = UdpSink::connect(peer, config.network.send_buffer_bytes).map_err(Error::Io)?;
        let sender = SendStage::start(
            ChunkSender::new(sink, &config.transport),
            config.pipeline.send_queue_capacity,
            &label,
        )
        .map_err(Error::Io)?;

        let transform = JpegTransform::new(&config.transform)?;
        let interval = (camera.fps > 0).then(|| Duration::from_secs(1) / camera.fps);

        let worker = {
            let frames = capture.frames();
            let packets = sender.packet_sender();
            thread::Builder::new()
                .name(format!("pipeline-{label}"))
                .spawn(move || transform_loop(frames, packets, transform, interval))
                .map_err(Error::Io)?
        };

        info!(
            label = %label,
            device = %camera.device,
            width = negotiated.width,
            height = negotiated.height,
            %peer,
            "pipeline running"
        );

        Ok(Self {
            label,
            capture,
            sender,
            worker: Some(worker),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the capture side is still delivering frames.
    pub fn is_running(&self) -> bool {
        self.capture.is_running()
    }

    /// Stop the chain: capture first (drains and releases every buffer,
    /// closes the device), then the transform thread, then the sender.
    pub fn stop(mut self) {
        info!(label = %self.label, "stopping pipeline");
        if let Some(fault) = self.capture.fault() {
            warn!(label = %self.label, error = %fault, "pipeline had stopped after a device fault");
        }
        self.capture.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(label = %self.label, "transform thread panicked");
            }
        }
        self.sender.stop();
        info!(label = %self.label, "pipeline stopped");
    }
}

/// Pull frames, encode, hand packets to the sender. Runs until the capture
/// stage stops. A failed frame is skipped, never fatal; the optional
/// interval paces the loop to the configured frame budget.
fn transform_loop(
    frames: FrameReceiver,
    mut packets: PacketSender,
    mut transform: JpegTransform,
    interval: Option<Duration>,
) {
    info!("transform loop started");
    let mut last_skip_log: Option<Instant> = None;
    let mut last_stats = Instant::now();
    let mut processed: u64 = 0;

    loop {
        let tick = Instant::now();
        let Some(frame) = frames.get_frame(GET_FRAME_STEP) else {
            break;
        };

        let encoded = transform.encode(&frame);
        // Release the kernel buffer before any pacing sleep.
        drop(frame);

        match encoded {
            Ok(jpeg) => {
                processed += 1;
                packets.enqueue(jpeg);
            }
            Err(e) => {
                let due = last_skip_log
                    .map(|t| t.elapsed() >= Duration::from_secs(5))
                    .unwrap_or(true);
                if due {
                    warn!(error = %e, "skipping frame");
                    last_skip_log = Some(Instant::now());
                }
                metrics::counter!("transform_frames_skipped").increment(1);
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            let (captured, _, dropped) = frames.stats();
            info!(processed, captured, dropped, "pipeline throughput");
            last_stats = Instant::now();
        }

        if let Some(interval) = interval {
            let next = tick + interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        }
    }
    info!("transform loop finished");
}
