//! # axum-media-range
//!
//! Conditional GET and byte-range serving for [`axum`][1].
//!
//! The engine implements the slice of HTTP/1.1 semantics that browsers
//! and media players rely on for seeking, resumable downloads, and cache
//! revalidation: `Range` (including `multipart/byteranges` responses),
//! `If-Range`, `If-Match`, `If-None-Match`, `If-Modified-Since`, and
//! `If-Unmodified-Since`.
//!
//! Bytes come from anything implementing [`MediaResource`]: a snapshot
//! of metadata ([`ResourceDescriptor`]) plus a readable, seekable body.
//! [`FileResource`] adapts a file on disk and [`MemoryResource`] a
//! generated in-memory buffer; applications with their own storage
//! implement the trait directly, which is also where authorization and
//! existence checks are answered.
//!
//! ```
//! use axum::extract::Request;
//! use axum::http::StatusCode;
//! use axum::response::{IntoResponse, Response};
//! use axum::routing::get;
//! use axum::Router;
//!
//! use axum_media_range::{FileResource, Ranged, RequestContext};
//!
//! async fn media(req: Request) -> Response {
//!     let ctx = RequestContext::new(req.method().clone(), req.headers());
//!     match FileResource::open("media/photo.jpg").await {
//!         Ok(resource) => Ranged::new(ctx, resource).into_response(),
//!         Err(_) => StatusCode::NOT_FOUND.into_response(),
//!     }
//! }
//!
//! let _app: Router = Router::new().route("/media", get(media));
//! ```
//!
//! [1]: https://docs.rs/axum

mod conditional;
mod context;
mod range;
mod resource;
mod serve;
mod stream;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek};

pub use context::RequestContext;
pub use range::{ByteRange, RangeError};
pub use resource::{FileResource, MediaResource, MemoryResource, ResourceDescriptor};
pub use serve::{Disposition, Ranged, ServeOptions, DEFAULT_CHUNK_SIZE};
pub use stream::{MultipartStream, RangedStream};

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// An [`AsyncRead`] and [`AsyncSeekStart`] byte source.
///
/// Automatically implemented for any type satisfying both bounds, which
/// covers [`tokio::fs::File`] and in-memory cursors alike.
pub trait RangeBody: AsyncRead + AsyncSeekStart {}

impl<T: AsyncRead + AsyncSeekStart> RangeBody for T {}
