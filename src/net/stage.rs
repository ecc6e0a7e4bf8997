//! Send pipeline stage: decouples frame production from network latency
//!
//! A bounded queue (capacity 1 by default, so only the newest frame waits)
//! feeds a dedicated thread that pushes packets through the chunked
//! transport. Stale packets are discarded rather than retried; for a live
//! stream the next frame is always worth more than a late one.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::net::transport::{ChunkSender, DatagramSink};
use crate::pipeline::queue::{BoundedQueue, Popped};

/// Wait step of the send loop; bounds shutdown latency
const POP_STEP: Duration = Duration::from_millis(250);
/// Minimum spacing between drop/backpressure log lines
const LOG_THROTTLE: Duration = Duration::from_secs(5);

/// Handle for producers to feed the send queue from another thread.
pub struct PacketSender {
    queue: Arc<BoundedQueue<Bytes>>,
    last_drop_log: Option<Instant>,
}

impl PacketSender {
    /// Queue a packet without blocking, displacing older queued packets
    /// when full. An empty packet is ignored.
    pub fn enqueue(&mut self, packet: Bytes) {
        if packet.is_empty() {
            return;
        }
        if let Some(stale) = self.queue.push(packet) {
            metrics::counter!("send_packets_dropped").increment(1);
            drop(stale);
            let due = self
                .last_drop_log
                .map(|t| t.elapsed() >= LOG_THROTTLE)
                .unwrap_or(true);
            if due {
                let (_, _, dropped) = self.queue.stats();
                debug!(dropped, "send queue full; superseding stale packet");
                self.last_drop_log = Some(Instant::now());
            }
        }
    }
}

/// A send thread plus the queue feeding it.
pub struct SendStage {
    queue: Arc<BoundedQueue<Bytes>>,
    worker: Option<JoinHandle<()>>,
}

impl SendStage {
    pub fn start<S: DatagramSink + 'static>(
        sender: ChunkSender<S>,
        queue_capacity: usize,
        label: &str,
    ) -> io::Result<Self> {
        let queue = Arc::new(BoundedQueue::new(queue_capacity));
        let worker = {
            let queue = queue.clone();
            thread::Builder::new()
                .name(format!("send-{label}"))
                .spawn(move || send_loop(queue, sender))?
        };
        Ok(Self {
            queue,
            worker: Some(worker),
        })
    }

    pub fn packet_sender(&self) -> PacketSender {
        PacketSender {
            queue: self.queue.clone(),
            last_drop_log: None,
        }
    }

    /// Stop the send thread. Packets still queued are dropped unsent; fast
    /// shutdown beats completeness here.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.queue.stop();
        let unsent = self.queue.drain().len();
        if unsent > 0 {
            debug!(unsent, "dropping queued packets on shutdown");
        }
        if worker.join().is_err() {
            warn!("send thread panicked");
        }
    }
}

impl Drop for SendStage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_loop<S: DatagramSink>(queue: Arc<BoundedQueue<Bytes>>, sender: ChunkSender<S>) {
    info!("send loop started");
    let mut last_backpressure_log: Option<Instant> = None;

    loop {
        let packet = match queue.pop_timeout(POP_STEP) {
            Popped::Item(packet) => packet,
            Popped::Empty => continue,
            Popped::Stopped => break,
        };

        // The packet is spent whatever happens below: retrying a whole
        // frame would only push fresher frames further behind.
        match sender.send(&packet) {
            Ok(()) => {
                metrics::counter!("send_packets_total").increment(1);
            }
            Err(e @ TransportError::Backpressure { .. }) => {
                metrics::counter!("send_packets_abandoned").increment(1);
                let due = last_backpressure_log
                    .map(|t| t.elapsed() >= LOG_THROTTLE)
                    .unwrap_or(true);
                if due {
                    warn!(error = %e, "dropping frame mid-send; peer or kernel cannot drain fast enough, next frame supersedes it");
                    last_backpressure_log = Some(Instant::now());
                }
            }
            Err(e) => {
                warn!(error = %e, "datagram send failed; packet discarded");
            }
        }
    }
    info!("send loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::tests::RecordingSink;
    use crate::TransportConfig;

    #[test]
    fn queued_packets_reach_the_sink() {
        let sink = RecordingSink::new();
        let sender = ChunkSender::new(sink.clone(), &TransportConfig::default());
        let mut stage = SendStage::start(sender, 1, "test").unwrap();
        let mut tx = stage.packet_sender();

        tx.enqueue(Bytes::from_static(b"hello frame"));

        // Wait for the worker to drain the queue before stopping.
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.taken().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        stage.stop();

        let datagrams = sink.taken();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0][0], crate::net::transport::LAST_CHUNK);
        assert_eq!(&datagrams[0][1..], b"hello frame");
    }

    #[test]
    fn empty_packets_are_ignored() {
        let sink = RecordingSink::new();
        let sender = ChunkSender::new(sink.clone(), &TransportConfig::default());
        let mut stage = SendStage::start(sender, 1, "test").unwrap();
        let mut tx = stage.packet_sender();

        tx.enqueue(Bytes::new());
        thread::sleep(Duration::from_millis(20));
        stage.stop();
        assert!(sink.taken().is_empty());
    }

    #[test]
    fn stop_is_idempotent_and_fast() {
        let sink = RecordingSink::new();
        let sender = ChunkSender::new(sink, &TransportConfig::default());
        let mut stage = SendStage::start(sender, 1, "test").unwrap();

        let start = Instant::now();
        stage.stop();
        stage.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
