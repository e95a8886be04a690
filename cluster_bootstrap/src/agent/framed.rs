/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Length-prefixed framing for the agent protocol.
//!
//! Every frame is an 8-byte big-endian `u64` length followed by
//! exactly that many body bytes. Frame boundaries are therefore
//! explicit and independent of how the transport splits writes.

use std::io;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

const LEN_SIZE: usize = 8;
/// Bodies grow as bytes arrive; a declared length alone reserves at most this.
const INITIAL_BODY_CAPACITY: usize = 8 * 1024;

/// Reads frames from an underlying [`AsyncRead`].
pub struct FrameReader<R> {
    reader: R,
    max_frame_length: usize,
    state: ReadState,
}

enum ReadState {
    /// Accumulating the length prefix.
    Len { buf: [u8; LEN_SIZE], off: usize },
    /// Accumulating a body of exactly `len` bytes.
    Body { buf: BytesMut, len: usize },
}

impl ReadState {
    fn start() -> Self {
        Self::Len {
            buf: [0; LEN_SIZE],
            off: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Frames longer than `max_frame_length` are rejected with
    /// `InvalidData`, after which the reader must be dropped.
    pub fn new(reader: R, max_frame_length: usize) -> Self {
        Self {
            reader,
            max_frame_length,
            state: ReadState::start(),
        }
    }

    /// Read the next frame. `Ok(None)` means the peer closed the
    /// stream on a frame boundary; a close inside a frame is an
    /// `UnexpectedEof` error.
    ///
    /// Progress is kept in `self`, so a dropped `next` future (e.g. in
    /// a `select!` or `timeout`) never loses bytes.
    pub async fn next(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match &mut self.state {
                ReadState::Len { buf, off } if *off < LEN_SIZE => {
                    let n = self.reader.read(&mut buf[*off..]).await?;
                    if n == 0 {
                        return if *off == 0 {
                            Ok(None)
                        } else {
                            Err(io::ErrorKind::UnexpectedEof.into())
                        };
                    }
                    *off += n;
                }
                ReadState::Len { buf, .. } => {
                    let len = (&buf[..]).get_u64() as usize;
                    if len > self.max_frame_length {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!(
                                "frame length {} exceeds max {}",
                                len, self.max_frame_length
                            ),
                        ));
                    }
                    self.state = ReadState::Body {
                        buf: BytesMut::with_capacity(len.min(INITIAL_BODY_CAPACITY)),
                        len,
                    };
                }
                ReadState::Body { buf, len } if buf.len() < *len => {
                    let remaining = *len - buf.len();
                    let n = (&mut self.reader).take(remaining as u64).read_buf(buf).await?;
                    if n == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                }
                ReadState::Body { buf, .. } => {
                    let frame = std::mem::take(buf).freeze();
                    self.state = ReadState::start();
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Change the limit for frames not yet started.
    pub fn set_max_frame_length(&mut self, max_frame_length: usize) {
        self.max_frame_length = max_frame_length;
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Write `body` as a single frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    max_frame_length: usize,
) -> io::Result<()> {
    if body.len() > max_frame_length {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame length {} exceeds max {}",
                body.len(),
                max_frame_length
            ),
        ));
    }
    let mut frame = BytesMut::with_capacity(LEN_SIZE + body.len());
    frame.put_u64(body.len() as u64);
    frame.put_slice(body);
    writer.write_all(&frame).await?;
    // Not every transport flushes implicitly.
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    const MAX_LEN: usize = 1024;

    #[tokio::test]
    async fn test_frames_roundtrip_in_order() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let mut reader = FrameReader::new(r, MAX_LEN);

        write_frame(&mut w, b"cast/host", MAX_LEN).await.unwrap();
        write_frame(&mut w, b"10.0.0.2", MAX_LEN).await.unwrap();
        write_frame(&mut w, b"", MAX_LEN).await.unwrap();

        assert_eq!(reader.next().await.unwrap().unwrap().as_ref(), b"cast/host");
        assert_eq!(reader.next().await.unwrap().unwrap().as_ref(), b"10.0.0.2");
        assert_eq!(reader.next().await.unwrap().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_eof_at_boundary_is_clean() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let mut reader = FrameReader::new(r, MAX_LEN);

        write_frame(&mut w, b"ok", MAX_LEN).await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);

        assert_eq!(
            reader.next().await.unwrap(),
            Some(Bytes::from_static(b"ok"))
        );
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let mut reader = FrameReader::new(r, MAX_LEN);

        let mut len = BytesMut::with_capacity(8);
        len.put_u64(5);
        w.write_all(&len).await.unwrap();
        w.write_all(b"he").await.unwrap();
        w.shutdown().await.unwrap();

        let err = reader.next().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let mut reader = FrameReader::new(r, 4);

        write_frame(&mut w, b"too long", MAX_LEN).await.unwrap();
        let err = reader.next().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = write_frame(&mut w, &[0u8; 16], 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_declared_length_does_not_reserve_body() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let mut reader = FrameReader::new(r, 1 << 30);

        let mut len = BytesMut::with_capacity(8);
        len.put_u64(1 << 30);
        w.write_all(&len).await.unwrap();
        w.write_all(b"partial").await.unwrap();

        // The body never arrives; the reader is left waiting on it.
        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), reader.next()).await;
        assert!(pending.is_err());
        let ReadState::Body { buf, len } = &reader.state else {
            panic!("reader should be inside the body");
        };
        assert_eq!(*len, 1 << 30);
        assert_eq!(buf.as_ref(), b"partial");
        assert!(buf.capacity() <= INITIAL_BODY_CAPACITY);
    }

    #[tokio::test]
    async fn test_large_body_grows_as_it_arrives() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let body = vec![7u8; 3 * INITIAL_BODY_CAPACITY + 5];
        let mut reader = FrameReader::new(r, body.len());

        let writing = tokio::spawn({
            let body = body.clone();
            async move { write_frame(&mut w, &body, body.len()).await.unwrap() }
        });
        assert_eq!(reader.next().await.unwrap().unwrap().as_ref(), &body[..]);
        writing.await.unwrap();
    }

    #[tokio::test]
    async fn test_raised_limit_applies_to_next_frame() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let mut reader = FrameReader::new(r, 4);

        write_frame(&mut w, b"tiny", MAX_LEN).await.unwrap();
        write_frame(&mut w, b"call/start_worker", MAX_LEN).await.unwrap();

        assert_eq!(reader.next().await.unwrap().unwrap().as_ref(), b"tiny");
        reader.set_max_frame_length(MAX_LEN);
        assert_eq!(
            reader.next().await.unwrap().unwrap().as_ref(),
            b"call/start_worker"
        );
    }

    #[tokio::test]
    async fn test_split_writes_reassemble() {
        let (a, b) = tokio::io::duplex(4096);
        let (r, _wu) = tokio::io::split(a);
        let (_ru, mut w) = tokio::io::split(b);
        let mut reader = FrameReader::new(r, MAX_LEN);

        let mut frame = BytesMut::new();
        frame.put_u64(11);
        frame.put_slice(b"call/status");
        for byte in frame.iter() {
            w.write_all(&[*byte]).await.unwrap();
        }

        assert_eq!(
            reader.next().await.unwrap().unwrap().as_ref(),
            b"call/status"
        );
    }
}
