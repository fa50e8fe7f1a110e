//! PCM ingest edge.
//!
//! Accepts canonical 4608-byte PCM frames from framed TCP connections and
//! delivers each one to the upstream PCM buffer. The edge validates frame
//! boundaries and nothing else: no gain, no mixing, no generation, no
//! timing. Transport disconnects are non-fatal; the accept loop simply waits
//! for the next connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::audio::FrameRingBuffer;
use crate::protocol_constants::PCM_FRAME_BYTES;

/// Counters exposed through the status API.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct IngestStats {
    /// Frames validated and delivered to the PCM buffer.
    pub frames_accepted: u64,
    /// Malformed deliveries discarded at the edge (trailing partials).
    pub invalid_frames: u64,
    /// Connections accepted since startup.
    pub connections: u64,
}

#[derive(Default)]
struct Counters {
    frames_accepted: AtomicU64,
    invalid_frames: AtomicU64,
    connections: AtomicU64,
}

/// Reassembles a byte stream into exactly-sized PCM frames.
///
/// Frames are never split, merged, padded, or mutated; bytes left over at
/// stream end are the caller's signal of a malformed trailing delivery.
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(PCM_FRAME_BYTES * 2),
        }
    }

    /// Feeds a chunk, returning every complete canonical frame now
    /// available, in arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.buf.len() >= PCM_FRAME_BYTES {
            frames.push(self.buf.split_to(PCM_FRAME_BYTES).freeze());
        }
        frames
    }

    /// Bytes buffered short of a full frame.
    pub fn residual(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts PCM transport connections and feeds the upstream buffer.
pub struct PcmIngest {
    pcm_buffer: Arc<FrameRingBuffer>,
    counters: Counters,
}

impl PcmIngest {
    pub fn new(pcm_buffer: Arc<FrameRingBuffer>) -> Self {
        Self {
            pcm_buffer,
            counters: Counters::default(),
        }
    }

    /// Snapshot of the edge counters.
    pub fn stats(&self) -> IngestStats {
        IngestStats {
            frames_accepted: self.counters.frames_accepted.load(Ordering::Relaxed),
            invalid_frames: self.counters.invalid_frames.load(Ordering::Relaxed),
            connections: self.counters.connections.load(Ordering::Relaxed),
        }
    }

    /// Accept loop. One task per connection; runs until cancelled.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        log::info!(
            "[Ingest] Listening for PCM on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.counters.connections.fetch_add(1, Ordering::Relaxed);
                            log::info!("[Ingest] PCM source connected: {peer}");
                            let ingest = Arc::clone(&self);
                            let conn_cancel = cancel.clone();
                            tokio::spawn(async move {
                                ingest.serve_connection(stream, conn_cancel).await;
                                log::info!("[Ingest] PCM source disconnected: {peer}");
                            });
                        }
                        Err(e) => {
                            // Transient accept errors are non-fatal.
                            log::warn!("[Ingest] Accept failed: {e}");
                        }
                    }
                }
            }
        }
        log::info!("[Ingest] Accept loop stopped");
    }

    /// Datagram transport: one canonical frame per datagram. Anything of a
    /// different size is discarded and counted; frame boundaries are the
    /// datagram boundaries, so no reassembly happens here.
    pub async fn run_udp(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        log::info!(
            "[Ingest] Listening for PCM datagrams on {}",
            socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        );

        // One byte of headroom so an oversized datagram is distinguishable
        // from an exact frame.
        let mut datagram = vec![0u8; PCM_FRAME_BYTES + 1];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut datagram) => {
                    match received {
                        Ok((len, _peer)) if len == PCM_FRAME_BYTES => {
                            self.deliver(vec![Bytes::copy_from_slice(&datagram[..len])]);
                        }
                        Ok((len, peer)) => {
                            self.counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
                            log::debug!(
                                "[Ingest] Discarding {len}-byte datagram from {peer} \
                                 (expected {PCM_FRAME_BYTES})"
                            );
                        }
                        Err(e) => {
                            log::warn!("[Ingest] Datagram receive failed: {e}");
                        }
                    }
                }
            }
        }
        log::info!("[Ingest] Datagram loop stopped");
    }

    async fn serve_connection(&self, mut stream: TcpStream, cancel: CancellationToken) {
        let mut assembler = FrameAssembler::new();
        let mut chunk = vec![0u8; PCM_FRAME_BYTES * 2];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                read = stream.read(&mut chunk) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => self.deliver(assembler.feed(&chunk[..n])),
                        Err(e) => {
                            log::debug!("[Ingest] Read error (connection dropped): {e}");
                            break;
                        }
                    }
                }
            }
        }

        if assembler.residual() > 0 {
            // A trailing partial is a malformed delivery: discard, count.
            self.counters.invalid_frames.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[Ingest] Discarding {} trailing bytes (not a whole frame)",
                assembler.residual()
            );
        }
    }

    fn deliver(&self, frames: Vec<Bytes>) {
        for frame in frames {
            // The assembler guarantees the canonical size; overflow inside
            // the buffer drops oldest and is tracked there.
            if self.pcm_buffer.push(frame).is_ok() {
                self.counters.frames_accepted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_emits_whole_frames_only() {
        let mut asm = FrameAssembler::new();
        let frame = vec![7u8; PCM_FRAME_BYTES];

        assert!(asm.feed(&frame[..1000]).is_empty());
        let frames = asm.feed(&frame[1000..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), PCM_FRAME_BYTES);
        assert_eq!(asm.residual(), 0);
    }

    #[test]
    fn assembler_splits_batched_frames() {
        let mut asm = FrameAssembler::new();
        let mut batch = vec![1u8; PCM_FRAME_BYTES];
        batch.extend_from_slice(&vec![2u8; PCM_FRAME_BYTES]);
        batch.extend_from_slice(&[3u8; 100]);

        let frames = asm.feed(&batch);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 1);
        assert_eq!(frames[1][0], 2);
        assert_eq!(asm.residual(), 100);
    }

    #[tokio::test]
    async fn udp_accepts_exact_frames_and_discards_the_rest() {
        let buffer = Arc::new(
            FrameRingBuffer::with_frame_size(8, PCM_FRAME_BYTES).unwrap(),
        );
        let ingest = Arc::new(PcmIngest::new(Arc::clone(&buffer)));
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&ingest).run_udp(socket, cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&vec![5u8; PCM_FRAME_BYTES], addr)
            .await
            .unwrap();
        client.send_to(&[5u8; 100], addr).await.unwrap();

        for _ in 0..100 {
            let stats = ingest.stats();
            if stats.frames_accepted == 1 && stats.invalid_frames == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let stats = ingest.stats();
        assert_eq!(stats.frames_accepted, 1);
        assert_eq!(stats.invalid_frames, 1);
        assert_eq!(buffer.len(), 1);

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn tcp_frames_reach_the_buffer() {
        let buffer = Arc::new(
            FrameRingBuffer::with_frame_size(8, PCM_FRAME_BYTES).unwrap(),
        );
        let ingest = Arc::new(PcmIngest::new(Arc::clone(&buffer)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&ingest).run(listener, cancel.clone()));

        {
            use tokio::io::AsyncWriteExt;
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&vec![9u8; PCM_FRAME_BYTES]).await.unwrap();
            client.write_all(&[9u8; 10]).await.unwrap(); // trailing partial
            client.shutdown().await.unwrap();
        }

        // Wait for the connection task to drain.
        for _ in 0..100 {
            if ingest.stats().frames_accepted == 1 && ingest.stats().invalid_frames == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let stats = ingest.stats();
        assert_eq!(stats.frames_accepted, 1);
        assert_eq!(stats.invalid_frames, 1);
        assert_eq!(stats.connections, 1);
        assert_eq!(buffer.len(), 1);

        cancel.cancel();
        let _ = task.await;
    }
}
