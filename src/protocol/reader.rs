//! Async frame reader.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Frame, FrameBuffer};
use crate::error::{Result, RpcError};

/// Read chunk size.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Pulls frames from an `AsyncRead`, in order.
///
/// `next_frame` is cancel-safe: all partial state lives in the reader, so it
/// can be raced in `tokio::select!` without losing bytes.
pub struct FrameReader<R> {
    inner: R,
    buffer: FrameBuffer,
    ready: VecDeque<Frame>,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream with the given maximum frame size.
    pub fn new(inner: R, max_frame_size: u32) -> Self {
        Self {
            inner,
            buffer: FrameBuffer::with_max_frame_size(max_frame_size),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Next frame.
    ///
    /// `Ok(None)` when the peer closes at a frame boundary,
    /// [`RpcError::UnexpectedEof`] when it closes inside one.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::UnexpectedEof);
            }

            self.ready.extend(self.buffer.push(&self.chunk[..n])?);
        }
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlCode;
    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_reads_sequence_then_clean_eof() {
        let (mut tx, rx) = tokio::io::duplex(16);
        let mut reader = FrameReader::new(rx, 1024);

        let writer = tokio::spawn(async move {
            let big = vec![7u8; 100];
            tx.write_all(&Frame::Data(Bytes::from(big)).to_bytes().unwrap())
                .await
                .unwrap();
            tx.write_all(&ControlCode::KeepAlive.encode().unwrap())
                .await
                .unwrap();
            tx.write_all(&Frame::Data(Bytes::from_static(b"z")).to_bytes().unwrap())
                .await
                .unwrap();
        });

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first.payload().unwrap().len(), 100);
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Code(ControlCode::KeepAlive))
        );
        assert_eq!(
            reader.next_frame().await.unwrap(),
            Some(Frame::Data(Bytes::from_static(b"z")))
        );

        writer.await.unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 1024);

        tx.write_all(&10i32.to_le_bytes()).await.unwrap();
        tx.write_all(b"abc").await.unwrap();
        drop(tx);

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, RpcError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_stream() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(rx, 8);

        tx.write_all(&9i32.to_le_bytes()).await.unwrap();

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, RpcError::FrameTooLarge { size: 9, max: 8 }));
    }
}
