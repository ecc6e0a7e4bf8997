//! Chunked datagram transport
//!
//! A compressed frame rarely fits one datagram, so it is split into chunks
//! of at most [`ChunkSender::chunk_payload`] bytes, each prefixed with a
//! one-byte flag: `1` on the chunk that ends the frame, `0` otherwise. The
//! receiver reconstructs frame boundaries from the flag alone. There is no
//! sequence field: under loss plus reordering a receiver cannot tell a
//! truncated frame from the next frame's chunks. That is the accepted
//! best-effort contract for a live stream, not a defect.

use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::TransportConfig;

/// Flag value on the final chunk of a frame
pub const LAST_CHUNK: u8 = 1;
/// Flag value on every other chunk
pub const MORE_CHUNKS: u8 = 0;

/// Where chunks go. The production sink is a connected UDP socket; tests
/// substitute recording or failing sinks.
pub trait DatagramSink: Send {
    /// Transmit one datagram assembled from `parts`, returning bytes written.
    fn send_chunk(&self, parts: &[IoSlice<'_>]) -> io::Result<usize>;
}

/// Non-blocking UDP socket bound to a single peer
pub struct UdpSink {
    socket: Socket,
}

impl UdpSink {
    /// Resolve and connect once at startup. Enlarging the kernel send
    /// buffer is best-effort; some platforms cap it below the request.
    pub fn connect(peer: SocketAddr, send_buffer_bytes: usize) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        if send_buffer_bytes > 0 {
            if let Err(e) = socket.set_send_buffer_size(send_buffer_bytes) {
                debug!(requested = send_buffer_bytes, error = %e, "send buffer left at default");
            }
        }
        socket.set_nonblocking(true)?;
        socket.connect(&SockAddr::from(peer))?;
        info!(%peer, "udp sink connected");
        Ok(Self { socket })
    }
}

impl DatagramSink for UdpSink {
    fn send_chunk(&self, parts: &[IoSlice<'_>]) -> io::Result<usize> {
        self.socket.send_vectored(parts)
    }
}

/// Splits packets into flagged chunks and pushes them through a sink with
/// bounded retry. At-most-once: a packet that exhausts its retries is
/// abandoned mid-stream; the caller's next packet supersedes it.
pub struct ChunkSender<S> {
    sink: S,
    chunk_payload: usize,
    retry_limit: u32,
    retry_backoff: Duration,
    pace_every: usize,
    pace_sleep: Duration,
}

impl<S: DatagramSink> ChunkSender<S> {
    pub fn new(sink: S, config: &TransportConfig) -> Self {
        Self {
            sink,
            chunk_payload: config.chunk_payload.max(1),
            retry_limit: config.retry_limit.max(1),
            retry_backoff: Duration::from_micros(config.retry_backoff_us),
            pace_every: config.pace_every,
            pace_sleep: Duration::from_micros(config.pace_sleep_us),
        }
    }

    /// Send one packet as `ceil(len / chunk_payload)` flagged datagrams, in
    /// order. An empty packet sends nothing.
    pub fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if packet.is_empty() {
            return Ok(());
        }
        let total = packet.len().div_ceil(self.chunk_payload);
        for (index, chunk) in packet.chunks(self.chunk_payload).enumerate() {
            let flag = [if index + 1 == total {
                LAST_CHUNK
            } else {
                MORE_CHUNKS
            }];
            self.send_one(&flag, chunk, index, total)?;

            if self.pace_every > 0 && (index + 1) % self.pace_every == 0 && index + 1 < total {
                thread::sleep(self.pace_sleep);
            }
        }
        Ok(())
    }

    fn send_one(
        &self,
        flag: &[u8; 1],
        chunk: &[u8],
        index: usize,
        total: usize,
    ) -> Result<(), TransportError> {
        let expected = 1 + chunk.len();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let parts = [IoSlice::new(flag), IoSlice::new(chunk)];
            match self.sink.send_chunk(&parts) {
                Ok(written) if written == expected => return Ok(()),
                Ok(written) => return Err(TransportError::ShortSend { written, expected }),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    if attempts >= self.retry_limit {
                        return Err(TransportError::Backpressure {
                            attempts,
                            sent: index,
                            total,
                        });
                    }
                    thread::sleep(self.retry_backoff);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Captures every datagram instead of sending it.
    #[derive(Clone)]
    pub(crate) struct RecordingSink {
        pub(crate) datagrams: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl RecordingSink {
        pub(crate) fn new() -> Self {
            Self {
                datagrams: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn taken(&self) -> Vec<Vec<u8>> {
            self.datagrams.lock().unwrap().clone()
        }
    }

    impl DatagramSink for RecordingSink {
        fn send_chunk(&self, parts: &[IoSlice<'_>]) -> io::Result<usize> {
            let datagram: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
            let len = datagram.len();
            self.datagrams.lock().unwrap().push(datagram);
            Ok(len)
        }
    }

    /// Reports a transient failure on every attempt.
    struct SaturatedSink {
        calls: Arc<AtomicU32>,
    }

    impl DatagramSink for SaturatedSink {
        fn send_chunk(&self, _parts: &[IoSlice<'_>]) -> io::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    fn test_config() -> TransportConfig {
        TransportConfig {
            retry_backoff_us: 0,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn chunking_round_trips_and_flags_the_last_chunk_only() {
        let sink = RecordingSink::new();
        let sender = ChunkSender::new(sink.clone(), &test_config());

        let packet: Vec<u8> = (0..64000u32).map(|i| (i % 251) as u8).collect();
        sender.send(&packet).unwrap();

        let datagrams = sink.taken();
        assert_eq!(datagrams.len(), 46);
        for datagram in &datagrams[..45] {
            assert_eq!(datagram[0], MORE_CHUNKS);
            assert_eq!(datagram.len(), 1401);
        }
        let last = &datagrams[45];
        assert_eq!(last[0], LAST_CHUNK);
        assert_eq!(last.len(), 1101, "64000 - 45*1400 = 1100 payload bytes");

        let reassembled: Vec<u8> = datagrams.iter().flat_map(|d| d[1..].to_vec()).collect();
        assert_eq!(reassembled, packet);
    }

    #[test]
    fn empty_packet_sends_nothing() {
        let sink = RecordingSink::new();
        let sender = ChunkSender::new(sink.clone(), &test_config());
        sender.send(&[]).unwrap();
        assert!(sink.taken().is_empty());
    }

    #[test]
    fn exact_multiple_still_flags_its_last_chunk() {
        let sink = RecordingSink::new();
        let sender = ChunkSender::new(sink.clone(), &test_config());
        sender.send(&vec![7u8; 2800]).unwrap();

        let datagrams = sink.taken();
        assert_eq!(datagrams.len(), 2);
        assert_eq!(datagrams[0][0], MORE_CHUNKS);
        assert_eq!(datagrams[1][0], LAST_CHUNK);
        assert_eq!(datagrams[1].len(), 1401);
    }

    #[test]
    fn retry_bound_gives_up_without_blocking() {
        let calls = Arc::new(AtomicU32::new(0));
        let sender = ChunkSender::new(
            SaturatedSink {
                calls: calls.clone(),
            },
            &test_config(),
        );

        let err = sender.send(&vec![0u8; 3000]).unwrap_err();
        match err {
            TransportError::Backpressure {
                attempts,
                sent,
                total,
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(sent, 0, "no later chunk may be attempted");
                assert_eq!(total, 3);
            }
            other => panic!("expected backpressure, got {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn non_transient_errors_abort_immediately() {
        struct DeadSink;
        impl DatagramSink for DeadSink {
            fn send_chunk(&self, _parts: &[IoSlice<'_>]) -> io::Result<usize> {
                Err(io::ErrorKind::PermissionDenied.into())
            }
        }
        let sender = ChunkSender::new(DeadSink, &test_config());
        assert!(matches!(
            sender.send(&[1, 2, 3]),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn loopback_datagrams_carry_flags_and_payload() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let peer = receiver.local_addr().unwrap();

        let sink = UdpSink::connect(peer, 0).unwrap();
        let sender = ChunkSender::new(sink, &test_config());
        let packet: Vec<u8> = (0..3000u32).map(|i| (i % 97) as u8).collect();
        sender.send(&packet).unwrap();

        let mut buf = [0u8; 2048];
        let mut reassembled = Vec::new();
        loop {
            let n = receiver.recv(&mut buf).unwrap();
            assert!(n >= 1);
            reassembled.extend_from_slice(&buf[1..n]);
            if buf[0] == LAST_CHUNK {
                break;
            }
        }
        assert_eq!(reassembled, packet);
    }
}
