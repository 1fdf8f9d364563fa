//! Streaming bridge between the driver read loop and the consumer.
//!
//! The driver calls back with a borrowed buffer that it reuses as soon as the
//! callback returns. [`StreamingBridge`] copies every buffer into an owned
//! [`StreamChunk`] and hands it to a [`ChunkSink`] before returning, so chunks
//! reach the consumer in driver order, one per buffer, never batched.
//!
//! Once cancellation has been requested the bridge stops delivering. Buffers
//! the driver still had in flight at that point are counted and logged as
//! discarded rather than dropped silently.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};

use futures::Stream;
use num_complex::Complex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::driver::{DEFAULT_ASYNC_BUF_NUMBER, DEFAULT_BUF_LENGTH, DriverHandle, DriverResult};
use crate::error::{self, LibusbErrorCode};

/// Read loop parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Number of driver transfer buffers
    pub buf_num: u32,
    /// Length of each buffer in bytes
    pub buf_len: u32,
    /// Capacity of the consumer channel used by `DeviceSession::stream`
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buf_num: DEFAULT_ASYNC_BUF_NUMBER,
            buf_len: DEFAULT_BUF_LENGTH,
            channel_capacity: DEFAULT_ASYNC_BUF_NUMBER as usize,
        }
    }
}

impl StreamConfig {
    pub fn new(buf_num: u32, buf_len: u32) -> Self {
        Self {
            buf_num,
            buf_len,
            channel_capacity: buf_num as usize,
        }
    }
}

/// One delivered buffer of raw sample bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    sequence: u64,
    data: Vec<u8>,
}

impl StreamChunk {
    fn copy_from(sequence: u64, buf: &[u8]) -> Self {
        Self {
            sequence,
            data: buf.to_vec(),
        }
    }

    /// Position of this chunk in its streaming run, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Interpret the bytes as interleaved unsigned 8-bit I/Q pairs.
    pub fn iq_samples(&self) -> Vec<Complex<f32>> {
        self.data
            .chunks_exact(2)
            .map(|c| Complex::new((c[0] as f32 - 127.5) / 128.0, (c[1] as f32 - 127.5) / 128.0))
            .collect()
    }
}

impl AsRef<[u8]> for StreamChunk {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Consumer side of the bridge.
pub trait ChunkSink {
    /// Take ownership of one chunk. Return `Break` once the consumer is gone;
    /// the bridge then cancels the read loop.
    fn deliver(&mut self, chunk: StreamChunk) -> ControlFlow<()>;
}

impl<F: FnMut(StreamChunk)> ChunkSink for F {
    fn deliver(&mut self, chunk: StreamChunk) -> ControlFlow<()> {
        self(chunk);
        ControlFlow::Continue(())
    }
}

/// Sink pushing chunks into a bounded channel.
///
/// `blocking_send` applies back-pressure to the read loop instead of dropping
/// chunks when the consumer falls behind. Must not be used from inside an
/// async task.
pub struct ChannelSink {
    tx: mpsc::Sender<error::Result<StreamChunk>>,
    cancelled: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn new(
        tx: mpsc::Sender<error::Result<StreamChunk>>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self { tx, cancelled }
    }

    /// Forward a read loop failure as the final item of the stream.
    pub fn fail(self, err: error::Error) {
        if self.tx.blocking_send(Err(err)).is_err() {
            debug!("stream consumer gone before the error could be reported");
        }
    }
}

impl ChunkSink for ChannelSink {
    fn deliver(&mut self, chunk: StreamChunk) -> ControlFlow<()> {
        if self.cancelled.load(Ordering::Acquire) {
            trace!("stream cancelled, not sending chunk {}", chunk.sequence());
            return ControlFlow::Continue(());
        }
        match self.tx.blocking_send(Ok(chunk)) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

/// Per-run statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub delivered: u64,
    pub discarded: u64,
}

/// Turns driver buffers into ordered chunks for one streaming run.
pub struct StreamingBridge<S> {
    sink: S,
    cancelled: Arc<AtomicBool>,
    stats: BridgeStats,
}

impl<S: ChunkSink> StreamingBridge<S> {
    pub fn new(sink: S, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            sink,
            cancelled,
            stats: BridgeStats::default(),
        }
    }

    /// Driver callback body. Must return before the driver reuses `buf`, so
    /// delivery happens here and not later.
    pub fn on_buffer<H: DriverHandle>(&mut self, buf: &[u8], handle: &H) {
        if self.cancelled.load(Ordering::Acquire) {
            self.stats.discarded += 1;
            trace!("discarding {} byte buffer after cancellation", buf.len());
            // The cancel may have reached the driver before its loop was running.
            handle.cancel_async();
            return;
        }

        let chunk = StreamChunk::copy_from(self.stats.delivered, buf);
        self.stats.delivered += 1;

        if self.sink.deliver(chunk).is_break() {
            debug!("stream consumer disconnected, cancelling read loop");
            self.cancelled.store(true, Ordering::Release);
            handle.cancel_async();
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// End the run, logging what was delivered and discarded.
    pub fn finish(self) -> (S, BridgeStats) {
        if self.stats.discarded > 0 {
            debug!(
                "stream ended: {} chunk(s) delivered, {} buffer(s) discarded after cancellation",
                self.stats.delivered, self.stats.discarded
            );
        } else {
            debug!("stream ended: {} chunk(s) delivered", self.stats.delivered);
        }
        (self.sink, self.stats)
    }
}

/// Run the driver read loop through `bridge` on the calling thread.
///
/// Zero buffers, or zero-length buffers, are rejected with
/// `LIBUSB_ERROR_INVALID_PARAM` before the driver is called.
pub(crate) fn run_read_loop<H: DriverHandle, S: ChunkSink>(
    handle: &H,
    bridge: &mut StreamingBridge<S>,
    config: &StreamConfig,
) -> DriverResult<()> {
    if config.buf_num == 0 || config.buf_len == 0 {
        debug!(
            "refusing read loop with {} buffers of {} bytes",
            config.buf_num, config.buf_len
        );
        return Err(LibusbErrorCode::InvalidParam.code());
    }
    handle.read_async(
        &mut |buf: &[u8]| bridge.on_buffer(buf, handle),
        config.buf_num,
        config.buf_len,
    )
}

/// Consumer half of a streaming run started with `DeviceSession::stream`.
///
/// Yields chunks in driver order. A read loop failure arrives as a final
/// `Err`; the stream then ends. After the run is stopped, chunks still queued
/// are dropped and only that final `Err`, if any, is yielded. Dropping the
/// stream makes the bridge cancel the read loop at the next buffer.
pub struct ChunkStream {
    rx: mpsc::Receiver<error::Result<StreamChunk>>,
    cancelled: Arc<AtomicBool>,
    dropped: u64,
    _handle: std::thread::JoinHandle<()>,
}

impl ChunkStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<error::Result<StreamChunk>>,
        cancelled: Arc<AtomicBool>,
        handle: std::thread::JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            cancelled,
            dropped: 0,
            _handle: handle,
        }
    }

    /// Wait for the next chunk on a non-async thread.
    pub fn next_blocking(&mut self) -> Option<error::Result<StreamChunk>> {
        loop {
            let item = self.rx.blocking_recv();
            if !self.drop_after_cancel(&item) {
                return item;
            }
        }
    }

    // Also reports the end of the stream once, when chunks were dropped.
    fn drop_after_cancel(&mut self, item: &Option<error::Result<StreamChunk>>) -> bool {
        match item {
            Some(Ok(_)) if self.cancelled.load(Ordering::Acquire) => {
                self.dropped += 1;
                true
            }
            None if self.dropped > 0 => {
                debug!("{} queued chunk(s) dropped after stop", self.dropped);
                self.dropped = 0;
                false
            }
            _ => false,
        }
    }
}

impl Stream for ChunkStream {
    type Item = error::Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let item = ready!(self.rx.poll_recv(cx));
            if !self.drop_after_cancel(&item) {
                return Poll::Ready(item);
            }
        }
    }
}
