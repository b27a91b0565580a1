use bytes::{Bytes, BytesMut};

use crate::cobs::TERMINATOR;

const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Splits an arbitrarily chunked byte stream into zero-terminated frames.
///
/// Handles partial reads internally: bytes after the last terminator stay
/// buffered until the next chunk completes them.
#[derive(Debug)]
pub struct Dechunker {
    buf: BytesMut,
}

impl Default for Dechunker {
    fn default() -> Self {
        Self::new()
    }
}

impl Dechunker {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Append a chunk read from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete frame (terminator included), if any.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let idx = self.buf.iter().position(|&b| b == TERMINATOR)?;
        Some(self.buf.split_to(idx + 1).freeze())
    }

    /// Number of bytes waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(feature = "async")]
pub use self::async_stream::{frames, FrameStream};

#[cfg(feature = "async")]
mod async_stream {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use bytes::Bytes;
    use futures_core::Stream;

    use super::Dechunker;

    /// Lazily yields complete frames from a stream of byte chunks.
    ///
    /// Frames are yielded raw; decoding is left to the consumer so a corrupt
    /// frame never stops extraction of the frames behind it.
    #[derive(Debug)]
    pub struct FrameStream<S> {
        inner: S,
        dechunker: Dechunker,
    }

    /// Start dechunking `chunks` with an empty buffer.
    pub fn frames<S>(chunks: S) -> FrameStream<S> {
        FrameStream {
            inner: chunks,
            dechunker: Dechunker::new(),
        }
    }

    impl<S> FrameStream<S> {
        /// Bytes received but not yet terminated.
        pub fn buffered(&self) -> usize {
            self.dechunker.buffered()
        }

        pub fn into_inner(self) -> S {
            self.inner
        }
    }

    impl<S, B> Stream for FrameStream<S>
    where
        S: Stream<Item = B> + Unpin,
        B: AsRef<[u8]>,
    {
        type Item = Bytes;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
            loop {
                if let Some(frame) = self.dechunker.next_frame() {
                    return Poll::Ready(Some(frame));
                }
                match Pin::new(&mut self.inner).poll_next(cx) {
                    Poll::Ready(Some(chunk)) => self.dechunker.push(chunk.as_ref()),
                    Poll::Ready(None) => {
                        if self.dechunker.buffered() > 0 {
                            tracing::debug!(
                                bytes = self.dechunker.buffered(),
                                "chunk stream ended mid-frame"
                            );
                        }
                        return Poll::Ready(None);
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cobs::{decode, encode};

    #[test]
    fn test_single_frame_in_one_chunk() {
        let frame = encode(b"hello").unwrap();
        let mut d = Dechunker::new();
        d.push(&frame);
        assert_eq!(d.next_frame().unwrap().as_ref(), frame.as_slice());
        assert!(d.next_frame().is_none());
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let frame = encode(&[1, 0, 2, 0, 3]).unwrap();
        let mut d = Dechunker::new();
        for byte in &frame[..frame.len() - 1] {
            d.push(&[*byte]);
            assert!(d.next_frame().is_none());
        }
        d.push(&frame[frame.len() - 1..]);
        let out = d.next_frame().unwrap();
        assert_eq!(decode(&out).unwrap(), vec![1, 0, 2, 0, 3]);
    }

    #[test]
    fn test_multiple_frames_and_remainder() {
        let a = encode(b"one").unwrap();
        let b = encode(b"two").unwrap();
        let c = encode(b"three").unwrap();
        let mut wire = Vec::new();
        wire.extend_from_slice(&a);
        wire.extend_from_slice(&b);
        wire.extend_from_slice(&c[..3]);

        let mut d = Dechunker::new();
        d.push(&wire);
        assert_eq!(d.next_frame().unwrap().as_ref(), a.as_slice());
        assert_eq!(d.next_frame().unwrap().as_ref(), b.as_slice());
        assert!(d.next_frame().is_none());
        assert_eq!(d.buffered(), 3);

        d.push(&c[3..]);
        assert_eq!(d.next_frame().unwrap().as_ref(), c.as_slice());
    }

    #[test]
    fn test_garbage_frame_is_isolated() {
        let good = encode(b"ok").unwrap();
        let mut d = Dechunker::new();
        d.push(&[0xFF, 0x00]);
        d.push(&good);

        let bad = d.next_frame().unwrap();
        assert!(decode(&bad).is_err());
        let next = d.next_frame().unwrap();
        assert_eq!(decode(&next).unwrap(), b"ok".to_vec());
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_frame_stream_over_chunks() {
        use std::future::poll_fn;
        use std::pin::Pin;

        use futures_core::Stream;

        struct Chunks(std::collections::VecDeque<Vec<u8>>);

        impl Stream for Chunks {
            type Item = Vec<u8>;
            fn poll_next(
                mut self: Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<Option<Vec<u8>>> {
                std::task::Poll::Ready(self.0.pop_front())
            }
        }

        let a = encode(b"alpha").unwrap();
        let b = encode(b"beta").unwrap();
        let mut wire = a.clone();
        wire.extend_from_slice(&b);
        let (first, second) = wire.split_at(4);
        let chunks = Chunks(vec![first.to_vec(), second.to_vec()].into());

        let mut stream = frames(chunks);
        let f1 = poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await.unwrap();
        let f2 = poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await.unwrap();
        let end = poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await;

        assert_eq!(f1.as_ref(), a.as_slice());
        assert_eq!(f2.as_ref(), b.as_slice());
        assert!(end.is_none());
    }
}
