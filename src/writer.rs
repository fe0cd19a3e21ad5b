//! Dedicated writer task for a connection.
//!
//! Every frame a connection sends goes through one task that owns the write
//! half, so frames are never interleaved on the wire:
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Stream
//! Caller N ─┘                                     │
//!                                  idle ──► KEEP_ALIVE code frame
//! ```
//!
//! - **Batching**: ready frames are written in a single `write_vectored` call
//! - **Backpressure**: producers wait (bounded) once too many frames are queued
//! - **Keep-alive**: a code frame goes out after an idle interval
//! - **Shutdown**: [`WriterHandle::close`] drains the queue to the stream;
//!   [`WriterHandle::abort`] drops it, failing each frame's acknowledgement

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backpressure::{WriteBudget, DEFAULT_MAX_PENDING, DEFAULT_TIMEOUT};
use crate::error::{Result, RpcError};
use crate::protocol::{encode_length, ControlCode, LENGTH_PREFIX_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = DEFAULT_MAX_PENDING;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = DEFAULT_TIMEOUT;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Write acknowledgement.
pub type WriteAck = oneshot::Receiver<Result<()>>;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    prefix: [u8; LENGTH_PREFIX_SIZE],
    payload: Bytes,
    ack: Option<oneshot::Sender<Result<()>>>,
}

impl OutboundFrame {
    /// Data frame carrying `payload`.
    pub fn data(payload: Bytes) -> Result<Self> {
        Ok(Self {
            prefix: encode_length(payload.len())?,
            payload,
            ack: None,
        })
    }

    /// Code frame.
    pub fn code(code: ControlCode) -> Result<Self> {
        Ok(Self {
            prefix: code.encode()?,
            payload: Bytes::new(),
            ack: None,
        })
    }

    /// Request an acknowledgement once the frame is flushed (or dropped).
    pub fn with_ack(mut self) -> (Self, WriteAck) {
        let (tx, rx) = oneshot::channel();
        self.ack = Some(tx);
        (self, rx)
    }

    /// Total size of this frame (prefix + payload).
    #[inline]
    pub fn size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.payload.len()
    }

    fn complete(&mut self, outcome: Result<()>) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(outcome);
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
    /// Idle time after which a keep-alive is sent. `None` disables keep-alives.
    pub keep_alive_interval: Option<Duration>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
            keep_alive_interval: None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    close: CancellationToken,
    abort: CancellationToken,
    finished: CancellationToken,
    cause: Mutex<Option<Arc<RpcError>>>,
}

impl Shared {
    fn lost_error(&self) -> RpcError {
        match &*self.cause.lock() {
            Some(cause) => RpcError::ConnectionLost(cause.clone()),
            None => RpcError::ConnectionClosed,
        }
    }

    fn set_cause(&self, cause: RpcError) -> Arc<RpcError> {
        let mut slot = self.cause.lock();
        match &*slot {
            Some(existing) => existing.clone(),
            None => {
                let cause = match cause {
                    RpcError::ConnectionLost(inner) => inner,
                    other => Arc::new(other),
                };
                *slot = Some(cause.clone());
                cause
            }
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    budget: WriteBudget,
    shared: Arc<Shared>,
}

impl WriterHandle {
    /// Queue a frame, waiting while backpressure is active.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_closing() {
            return Err(self.shared.lost_error());
        }

        self.budget.acquire().await?;

        self.tx.send(frame).await.map_err(|_| {
            self.budget.give_back();
            self.shared.lost_error()
        })
    }

    /// Queue a frame and wait until it has been flushed to the stream.
    pub async fn send_and_flush(&self, frame: OutboundFrame) -> Result<()> {
        let (frame, ack) = frame.with_ack();
        self.send(frame).await?;
        ack.await.map_err(|_| self.shared.lost_error())?
    }

    /// Queue a frame without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_closing() {
            return Err(self.shared.lost_error());
        }

        self.budget.try_acquire()?;

        self.tx.try_send(frame).map_err(|e| {
            self.budget.give_back();
            match e {
                mpsc::error::TrySendError::Full(_) => RpcError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => self.shared.lost_error(),
            }
        })
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.budget.is_exhausted()
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.budget.in_use()
    }

    /// Flush what is queued, shut down the stream, and stop.
    pub fn close(&self) {
        self.shared.close.cancel();
    }

    /// Stop without writing what is queued; each dropped frame's
    /// acknowledgement fails with `ConnectionLost(cause)`.
    pub fn abort(&self, cause: RpcError) {
        self.shared.set_cause(cause);
        self.shared.abort.cancel();
    }

    /// Whether close or abort was requested, or the task already exited.
    pub fn is_closing(&self) -> bool {
        self.shared.close.is_cancelled()
            || self.shared.abort.is_cancelled()
            || self.shared.finished.is_cancelled()
    }

    /// Resolves once the writer task has exited.
    pub async fn finished(&self) {
        self.shared.finished.cancelled().await
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The `JoinHandle` resolves to the write error that stopped the task, if any.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let budget =
        WriteBudget::new(config.max_pending_frames, config.backpressure_timeout);
    let shared = Arc::new(Shared::default());

    let handle = WriterHandle {
        tx,
        budget: budget.clone(),
        shared: shared.clone(),
    };

    let task = tokio::spawn(async move {
        let _finished = shared.finished.clone().drop_guard();
        writer_loop(rx, writer, &shared, &budget, config.keep_alive_interval).await
    });

    (handle, task)
}

async fn idle(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

/// Main writer loop - receives frames and writes them to the stream.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    shared: &Shared,
    budget: &WriteBudget,
    keep_alive: Option<Duration>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let (first, reserved_first) = tokio::select! {
            biased;

            _ = shared.abort.cancelled() => {
                abort_queue(&mut rx, shared, budget);
                return Ok(());
            }
            _ = shared.close.cancelled() => {
                return drain_and_shutdown(&mut rx, &mut writer, shared, budget).await;
            }
            frame = rx.recv() => match frame {
                Some(frame) => (frame, true),
                None => {
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            },
            _ = idle(keep_alive) => {
                tracing::trace!("Writer idle, sending keep-alive");
                (OutboundFrame::code(ControlCode::KeepAlive)?, false)
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        collect_ready(&mut rx, &mut batch);

        // Idle keep-alives are not charged to the budget.
        let reserved = batch.len() - usize::from(!reserved_first);
        write_or_abort(&mut writer, batch, reserved, &mut rx, shared, budget).await?;
    }
}

fn collect_ready(rx: &mut mpsc::Receiver<OutboundFrame>, batch: &mut Vec<OutboundFrame>) {
    while batch.len() < MAX_BATCH_SIZE {
        match rx.try_recv() {
            Ok(frame) => batch.push(frame),
            Err(_) => break,
        }
    }
}

async fn write_or_abort<W>(
    writer: &mut W,
    mut batch: Vec<OutboundFrame>,
    reserved: usize,
    rx: &mut mpsc::Receiver<OutboundFrame>,
    shared: &Shared,
    budget: &WriteBudget,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let outcome = write_batch(writer, &batch).await;
    budget.give_back_many(reserved);

    match outcome {
        Ok(()) => {
            for frame in &mut batch {
                frame.complete(Ok(()));
            }
            Ok(())
        }
        Err(e) => {
            tracing::warn!(error = %e, "Writer failed, dropping queued frames");
            let cause = shared.set_cause(e);
            for frame in &mut batch {
                frame.complete(Err(RpcError::ConnectionLost(cause.clone())));
            }
            abort_queue(rx, shared, budget);
            Err(RpcError::ConnectionLost(cause))
        }
    }
}

async fn drain_and_shutdown<W>(
    rx: &mut mpsc::Receiver<OutboundFrame>,
    writer: &mut W,
    shared: &Shared,
    budget: &WriteBudget,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    rx.close();
    loop {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        collect_ready(rx, &mut batch);
        if batch.is_empty() {
            break;
        }
        let count = batch.len();
        write_or_abort(writer, batch, count, rx, shared, budget).await?;
    }
    let _ = writer.shutdown().await;
    tracing::debug!("Writer drained and closed");
    Ok(())
}

fn abort_queue(
    rx: &mut mpsc::Receiver<OutboundFrame>,
    shared: &Shared,
    budget: &WriteBudget,
) {
    rx.close();
    let mut dropped = 0usize;
    while let Ok(mut frame) = rx.try_recv() {
        frame.complete(Err(shared.lost_error()));
        dropped += 1;
    }
    budget.give_back_many(dropped);
    if dropped > 0 {
        tracing::debug!(dropped, "Writer aborted with frames still queued");
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.prefix[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, FrameReader};
    use std::io::Cursor;
    use tokio::io::duplex;

    fn data(bytes: &'static [u8]) -> OutboundFrame {
        OutboundFrame::data(Bytes::from_static(bytes)).unwrap()
    }

    #[test]
    fn test_outbound_frame_sizes() {
        assert_eq!(data(b"hello").size(), LENGTH_PREFIX_SIZE + 5);
        assert_eq!(
            OutboundFrame::code(ControlCode::KeepAlive).unwrap().size(),
            LENGTH_PREFIX_SIZE
        );
        assert!(OutboundFrame::data(Bytes::new()).is_err());
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![data(b"hello")];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 2);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, LENGTH_PREFIX_SIZE + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 4);
    }

    #[tokio::test]
    async fn test_write_batch_layout() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![data(b"abc"), OutboundFrame::code(ControlCode::Teardown1).unwrap()];

        write_batch(&mut buf, &batch).await.unwrap();

        let mut expected = vec![3, 0, 0, 0, b'a', b'b', b'c'];
        expected.extend_from_slice(&(-4i32).to_le_bytes());
        assert_eq!(buf.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for payload in [&b"one"[..], b"two", b"three"] {
            handle
                .send(OutboundFrame::data(Bytes::from_static(payload)).unwrap())
                .await
                .unwrap();
        }

        let mut reader = FrameReader::new(server, 1024);
        for expected in [&b"one"[..], b"two", b"three"] {
            let frame = reader.next_frame().await.unwrap().unwrap();
            assert_eq!(frame, Frame::Data(Bytes::from_static(expected)));
        }
    }

    #[tokio::test]
    async fn test_send_and_flush_acknowledges() {
        let (client, _server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle.send_and_flush(data(b"x")).await.unwrap();
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_when_idle() {
        let (client, server) = duplex(4096);
        let config = WriterConfig {
            keep_alive_interval: Some(Duration::from_millis(100)),
            ..WriterConfig::default()
        };
        let (_handle, _task) = spawn_writer_task(client, config);

        let mut reader = FrameReader::new(server, 1024);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Code(ControlCode::KeepAlive));
    }

    #[tokio::test]
    async fn test_close_drains_queue() {
        let (client, server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(data(b"a")).await.unwrap();
        handle.send(data(b"b")).await.unwrap();
        handle.close();
        task.await.unwrap().unwrap();

        let mut reader = FrameReader::new(server, 1024);
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Data(Bytes::from_static(b"a")))
        );
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Data(Bytes::from_static(b"b")))
        );
        assert_eq!(reader.next_frame().await.unwrap(), None);
        assert!(handle.send(data(b"c")).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_fails_queued_acks() {
        // Tiny pipe that nobody reads: the first write blocks the task.
        let (client, server) = duplex(1);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(data(b"blocked")).await.unwrap();
        tokio::task::yield_now().await;
        let (frame, ack) = data(b"queued").with_ack();
        handle.send(frame).await.unwrap();

        handle.abort(RpcError::StreamClosed);

        // Unblock the stuck write with a broken pipe.
        drop(server);
        let _ = task.await.unwrap();

        let err = ack.await.unwrap().unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (client, _server) = duplex(1);
        let config = WriterConfig {
            max_pending_frames: 1,
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(client, config);

        handle.try_send(data(b"first-frame")).unwrap();
        let result = handle.try_send(data(b"second"));
        assert!(matches!(result, Err(RpcError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
