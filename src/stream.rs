//! Response body streams.
//!
//! Both streams hold the byte source and deliver it in bounded chunks
//! through a small seek/read state machine. Cancellation is the axum
//! model: when the client disconnects the body is dropped, which ends
//! the poll loop mid-transfer without surfacing an error.

use std::{io, mem};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::ReadBuf;

use crate::range::ByteRange;
use crate::RangeBody;

/// Boundary token for `multipart/byteranges` bodies. A fixed literal:
/// the analytic `Content-Length` in [`multipart_content_length`] depends
/// on the emitted framing being fully determined by the range set.
pub(crate) const MULTIPART_BOUNDARY: &str = "3d9a08cbe1dd4c7a";

/// Single contiguous span of the byte source, streamed in chunks of at
/// most `chunk_size` bytes. Implements [`Stream`], [`Body`], and
/// [`IntoResponse`].
#[pin_project]
pub struct RangedStream<B> {
    state: StreamState,
    length: u64,
    chunk_size: usize,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> RangedStream<B> {
    pub(crate) fn new(body: B, start: u64, length: u64, chunk_size: usize) -> Self {
        RangedStream {
            state: StreamState::Seek { start },
            length,
            chunk_size,
            body,
        }
    }
}

#[derive(Debug)]
enum StreamState {
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        self.poll_next(cx)
            .map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        if let StreamState::Seek { start } = *this.state {
            match this.body.as_mut().start_seek(start) {
                Err(e) => return Poll::Ready(Some(Err(e))),
                Ok(()) => {
                    let remaining = *this.length;
                    *this.state = StreamState::Seeking { remaining };
                }
            }
        }

        if let StreamState::Seeking { remaining } = *this.state {
            match this.body.as_mut().poll_complete(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Ok(())) => {
                    let buffer = allocate_buffer(*this.chunk_size);
                    *this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        if let StreamState::Reading { buffer, remaining } = this.state {
            if *remaining == 0 {
                return Poll::Ready(None);
            }

            let uninit = buffer.spare_capacity_mut();

            // read the smaller of the chunk size and the bytes left in
            // the requested span
            let nbytes = std::cmp::min(
                uninit.len(),
                usize::try_from(*remaining).unwrap_or(usize::MAX),
            );

            let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

            match this.body.as_mut().poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Ok(())) => {
                    return match read_buf.filled().len() {
                        0 => Poll::Ready(None),
                        n => {
                            // SAFETY: poll_read filled `n` additional
                            // bytes past the buffer's current length
                            unsafe { buffer.set_len(buffer.len() + n) };

                            let chunk_size = *this.chunk_size;
                            let chunk = mem::replace(buffer, allocate_buffer(chunk_size));

                            // n <= remaining thanks to the cmp::min above
                            *remaining -= n as u64;

                            Poll::Ready(Some(Ok(chunk.freeze())))
                        }
                    };
                }
            }
        }

        unreachable!();
    }
}

/// `multipart/byteranges` body: each requested span is framed as a MIME
/// part carrying its own `Content-Range`, in request order, against one
/// seekable byte source. Implements [`Stream`], [`Body`], and
/// [`IntoResponse`].
#[pin_project]
pub struct MultipartStream<B> {
    state: MultipartState,
    ranges: Vec<ByteRange>,
    part: usize,
    total_size: u64,
    mime_type: String,
    length: u64,
    chunk_size: usize,
    #[pin]
    body: B,
}

impl<B: RangeBody + Send + 'static> MultipartStream<B> {
    pub(crate) fn new(
        body: B,
        ranges: Vec<ByteRange>,
        total_size: u64,
        mime_type: String,
        chunk_size: usize,
    ) -> Self {
        let length = multipart_content_length(&ranges, &mime_type, total_size);
        MultipartStream {
            state: MultipartState::PartHeader,
            ranges,
            part: 0,
            total_size,
            mime_type,
            length,
            chunk_size,
            body,
        }
    }
}

#[derive(Debug)]
enum MultipartState {
    PartHeader,
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    PartEnd,
    Trailer,
    Finished,
}

/// Header block opening one part. Also the unit of the analytic length
/// computation, so stream emission and the declared `Content-Length`
/// cannot drift apart.
fn part_header(mime_type: &str, range: &ByteRange, total_size: u64) -> String {
    format!(
        "--{MULTIPART_BOUNDARY}\r\nContent-Type: {mime_type}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
        range.start, range.end, total_size,
    )
}

/// Exact size of the multipart body, computed before streaming begins:
/// each part's header block plus its byte span plus the closing CRLF,
/// then the final `--boundary--` terminator.
pub(crate) fn multipart_content_length(
    ranges: &[ByteRange],
    mime_type: &str,
    total_size: u64,
) -> u64 {
    let parts: u64 = ranges
        .iter()
        .map(|range| part_header(mime_type, range, total_size).len() as u64 + range.len() + 2)
        .sum();
    parts + MULTIPART_BOUNDARY.len() as u64 + 6
}

impl<B: RangeBody + Send + 'static> IntoResponse for MultipartStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: RangeBody> Body for MultipartStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        self.poll_next(cx)
            .map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: RangeBody> Stream for MultipartStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        loop {
            match this.state {
                MultipartState::PartHeader => {
                    let Some(range) = this.ranges.get(*this.part) else {
                        *this.state = MultipartState::Trailer;
                        continue;
                    };

                    let header = part_header(this.mime_type, range, *this.total_size);
                    *this.state = MultipartState::Seek { start: range.start };
                    return Poll::Ready(Some(Ok(Bytes::from(header))));
                }

                MultipartState::Seek { start } => match this.body.as_mut().start_seek(*start) {
                    Err(e) => return Poll::Ready(Some(Err(e))),
                    Ok(()) => {
                        let remaining = this.ranges[*this.part].len();
                        *this.state = MultipartState::Seeking { remaining };
                    }
                },

                MultipartState::Seeking { remaining } => {
                    match this.body.as_mut().poll_complete(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                        Poll::Ready(Ok(())) => {
                            let buffer = allocate_buffer(*this.chunk_size);
                            *this.state = MultipartState::Reading {
                                buffer,
                                remaining: *remaining,
                            };
                        }
                    }
                }

                MultipartState::Reading { buffer, remaining } => {
                    if *remaining == 0 {
                        *this.state = MultipartState::PartEnd;
                        continue;
                    }

                    let uninit = buffer.spare_capacity_mut();

                    let nbytes = std::cmp::min(
                        uninit.len(),
                        usize::try_from(*remaining).unwrap_or(usize::MAX),
                    );

                    let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

                    match this.body.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                        Poll::Ready(Ok(())) => match read_buf.filled().len() {
                            0 => {
                                // the source ended before the declared
                                // span; the framing can no longer match
                                // the announced Content-Length
                                return Poll::Ready(Some(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "byte source ended inside a range part",
                                ))));
                            }
                            n => {
                                // SAFETY: poll_read filled `n` additional
                                // bytes past the buffer's current length
                                unsafe { buffer.set_len(buffer.len() + n) };

                                let chunk_size = *this.chunk_size;
                                let chunk = mem::replace(buffer, allocate_buffer(chunk_size));

                                *remaining -= n as u64;

                                return Poll::Ready(Some(Ok(chunk.freeze())));
                            }
                        },
                    }
                }

                MultipartState::PartEnd => {
                    *this.part += 1;
                    *this.state = MultipartState::PartHeader;
                    return Poll::Ready(Some(Ok(Bytes::from_static(b"\r\n"))));
                }

                MultipartState::Trailer => {
                    *this.state = MultipartState::Finished;
                    let trailer = format!("--{MULTIPART_BOUNDARY}--\r\n");
                    return Poll::Ready(Some(Ok(Bytes::from(trailer))));
                }

                MultipartState::Finished => return Poll::Ready(None),
            }
        }
    }
}

fn allocate_buffer(chunk_size: usize) -> BytesMut {
    BytesMut::with_capacity(chunk_size)
}

#[cfg(test)]
mod tests {
    use futures::{pin_mut, StreamExt};

    use super::*;

    fn source(length: usize) -> std::io::Cursor<Vec<u8>> {
        std::io::Cursor::new((0..length).map(|i| (i % 256) as u8).collect())
    }

    async fn collect(stream: impl Stream<Item = io::Result<Bytes>>) -> Vec<u8> {
        let mut bytes = Vec::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await.transpose().unwrap() {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    #[tokio::test]
    async fn ranged_stream_delivers_exact_span() {
        let stream = RangedStream::new(source(1000), 10, 20, 7);
        let bytes = collect(stream).await;
        assert_eq!((10..30).map(|i| i as u8).collect::<Vec<_>>(), bytes);
    }

    #[tokio::test]
    async fn ranged_stream_respects_chunk_size() {
        let stream = RangedStream::new(source(1000), 0, 100, 16);
        pin_mut!(stream);
        let mut total = 0;
        while let Some(chunk) = stream.next().await.transpose().unwrap() {
            assert!(chunk.len() <= 16);
            total += chunk.len();
        }
        assert_eq!(100, total);
    }

    #[tokio::test]
    async fn multipart_length_matches_emitted_bytes() {
        let ranges = vec![ByteRange::new(0, 99), ByteRange::new(500, 599)];
        let declared = multipart_content_length(&ranges, "text/plain", 1000);

        let stream = MultipartStream::new(source(1000), ranges, 1000, "text/plain".into(), 64);
        let bytes = collect(stream).await;
        assert_eq!(declared, bytes.len() as u64);
    }

    #[tokio::test]
    async fn multipart_parts_come_in_request_order() {
        let ranges = vec![ByteRange::new(500, 504), ByteRange::new(0, 4)];
        let stream = MultipartStream::new(source(1000), ranges, 1000, "text/plain".into(), 64);
        let bytes = collect(stream).await;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let first = text.find("Content-Range: bytes 500-504/1000").unwrap();
        let second = text.find("Content-Range: bytes 0-4/1000").unwrap();
        assert!(first < second);
        assert!(text.ends_with(&format!("--{MULTIPART_BOUNDARY}--\r\n")));
    }
}
