//! Request orchestration: resolve metadata, plan ranges, run the
//! conditional pipeline, and emit the response.
//!
//! All headers for a response are assembled before any body byte is
//! produced; the body streams lazily afterwards. The resource (and the
//! stream it owns) is dropped on every path out of a request, including
//! early terminations.

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::conditional::{Outcome, Pipeline};
use crate::context::RequestContext;
use crate::range::{self, ByteRange, RangePlan};
use crate::resource::{MediaResource, ResourceDescriptor};
use crate::stream::{self, MultipartStream, RangedStream};

/// Default streaming chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024;

const UNAUTHORIZED_BODY: &str = "<html><body>Unauthorized user</body></html>";

/// How the entity is offered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

/// Per-deployment serving knobs, supplied at construction and read-only
/// for the lifetime of a request.
#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    /// Upper bound on the size of each streamed chunk.
    pub chunk_size: usize,
    /// `Content-Disposition` type used when the resource has a file name.
    pub disposition: Disposition,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeOptions {
            chunk_size: DEFAULT_CHUNK_SIZE,
            disposition: Disposition::Inline,
        }
    }
}

/// The responder. Owns one request's context and resource, and turns
/// them into a complete HTTP response. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct Ranged<R: MediaResource> {
    ctx: RequestContext,
    resource: R,
    options: ServeOptions,
}

impl<R: MediaResource> Ranged<R> {
    pub fn new(ctx: RequestContext, resource: R) -> Self {
        Ranged::with_options(ctx, resource, ServeOptions::default())
    }

    pub fn with_options(ctx: RequestContext, resource: R, options: ServeOptions) -> Self {
        Ranged { ctx, resource, options }
    }

    /// Run the request lifecycle to completion.
    pub fn respond(self) -> Response {
        let descriptor = self.resource.descriptor().clone();
        let plan = range::plan(self.ctx.range(), descriptor.length);

        let outcome = Pipeline {
            ctx: &self.ctx,
            resource: &self.resource,
            plan: &plan,
        }
        .run();

        match outcome {
            Outcome::Fail(status) => failure_response(status),
            Outcome::NotModified => not_modified_response(&descriptor),
            Outcome::ServeFull => self.full_response(&descriptor),
            Outcome::Continue => match plan {
                // the range-sanity stage vetoes before we get here
                Err(_) => failure_response(StatusCode::BAD_REQUEST),
                Ok(plan) if !plan.is_range_request => self.full_response(&descriptor),
                Ok(plan) => self.partial_response(&descriptor, plan),
            },
        }
    }

    /// 200 with the entire entity.
    fn full_response(self, descriptor: &ResourceDescriptor) -> Response {
        tracing::debug!(length = descriptor.length, "serving full entity");

        let mut headers = entity_headers(descriptor, &self.ctx, self.options.disposition);
        insert(&mut headers, header::CONTENT_TYPE, &descriptor.mime_type);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(descriptor.length));

        let body = if self.ctx.is_head() {
            Body::empty()
        } else {
            Body::new(RangedStream::new(
                self.resource.into_body(),
                0,
                descriptor.length,
                self.options.chunk_size,
            ))
        };

        (StatusCode::OK, headers, body).into_response()
    }

    /// 206, either a single span or a `multipart/byteranges` body.
    fn partial_response(self, descriptor: &ResourceDescriptor, plan: RangePlan) -> Response {
        if plan.is_multipart() {
            self.multipart_response(descriptor, plan.ranges)
        } else {
            match plan.ranges.first() {
                Some(range) => self.single_range_response(descriptor, *range),
                // an explicit range request always parses to at least
                // one span; an empty set means an empty resource
                None => failure_response(StatusCode::BAD_REQUEST),
            }
        }
    }

    fn single_range_response(self, descriptor: &ResourceDescriptor, range: ByteRange) -> Response {
        tracing::debug!(%range, length = descriptor.length, "serving single range");

        let mut headers = entity_headers(descriptor, &self.ctx, self.options.disposition);
        insert(&mut headers, header::CONTENT_TYPE, &descriptor.mime_type);
        insert(
            &mut headers,
            header::CONTENT_RANGE,
            &format!("bytes {}-{}/{}", range.start, range.end, descriptor.length),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));

        let body = if self.ctx.is_head() {
            Body::empty()
        } else {
            Body::new(RangedStream::new(
                self.resource.into_body(),
                range.start,
                range.len(),
                self.options.chunk_size,
            ))
        };

        (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
    }

    fn multipart_response(self, descriptor: &ResourceDescriptor, ranges: Vec<ByteRange>) -> Response {
        tracing::debug!(parts = ranges.len(), length = descriptor.length, "serving multipart ranges");

        let content_length =
            stream::multipart_content_length(&ranges, &descriptor.mime_type, descriptor.length);

        let mut headers = entity_headers(descriptor, &self.ctx, self.options.disposition);
        insert(
            &mut headers,
            header::CONTENT_TYPE,
            &format!("multipart/byteranges; boundary={}", stream::MULTIPART_BOUNDARY),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));

        let body = if self.ctx.is_head() {
            Body::empty()
        } else {
            Body::new(MultipartStream::new(
                self.resource.into_body(),
                ranges,
                descriptor.length,
                descriptor.mime_type.clone(),
                self.options.chunk_size,
            ))
        };

        (StatusCode::PARTIAL_CONTENT, headers, body).into_response()
    }
}

impl<R: MediaResource> IntoResponse for Ranged<R> {
    fn into_response(self) -> Response {
        self.respond()
    }
}

/// Headers common to every 200/206 response.
fn entity_headers(
    descriptor: &ResourceDescriptor,
    ctx: &RequestContext,
    disposition: Disposition,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(tag) = &descriptor.entity_tag {
        insert(&mut headers, header::ETAG, &format!("\"{tag}\""));
    }
    if let Some(modified) = descriptor.last_modified {
        insert(&mut headers, header::LAST_MODIFIED, &httpdate::fmt_http_date(modified));
    }
    if let Some(value) = content_disposition(descriptor, disposition, ctx.user_agent()) {
        insert(&mut headers, header::CONTENT_DISPOSITION, &value);
    }

    headers
}

fn not_modified_response(descriptor: &ResourceDescriptor) -> Response {
    tracing::debug!("cache validator matched, not modified");

    let mut headers = HeaderMap::new();
    if let Some(tag) = &descriptor.entity_tag {
        insert(&mut headers, header::ETAG, &format!("\"{tag}\""));
    }
    if let Some(modified) = descriptor.last_modified {
        insert(&mut headers, header::LAST_MODIFIED, &httpdate::fmt_http_date(modified));
    }

    (StatusCode::NOT_MODIFIED, headers, Body::empty()).into_response()
}

/// Terminal statuses carry no entity detail, except 403 which gets a
/// minimal HTML fragment.
fn failure_response(status: StatusCode) -> Response {
    if status == StatusCode::FORBIDDEN {
        (status, Html(UNAUTHORIZED_BODY)).into_response()
    } else {
        status.into_response()
    }
}

fn content_disposition(
    descriptor: &ResourceDescriptor,
    disposition: Disposition,
    user_agent: Option<&str>,
) -> Option<String> {
    let name = descriptor.file_name.as_deref()?;
    let kind = match disposition {
        Disposition::Inline => "inline",
        Disposition::Attachment => "attachment",
    };

    // IE substitutes underscores for spaces in the suggested file name
    // unless the spaces are percent-encoded
    let name = if is_internet_explorer(user_agent) {
        name.replace(' ', "%20")
    } else {
        name.to_owned()
    };

    Some(format!("{kind}; filename=\"{name}\""))
}

fn is_internet_explorer(user_agent: Option<&str>) -> bool {
    user_agent.is_some_and(|ua| ua.contains("MSIE") || ua.contains("Trident"))
}

fn insert(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use axum::http::header::HeaderName;
    use axum::http::Method;
    use futures::StreamExt;

    use crate::resource::MemoryResource;
    use crate::stream::MULTIPART_BOUNDARY;

    use super::*;

    const LENGTH: usize = 1000;

    fn t0() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_600_000_000)
    }

    fn content() -> Vec<u8> {
        (0..LENGTH).map(|i| (i % 251) as u8).collect()
    }

    fn fixture() -> MemoryResource {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        MemoryResource::new(content(), "application/octet-stream")
            .with_entity_tag("abc")
            .with_last_modified(t0())
    }

    fn context(method: Method, headers: &[(HeaderName, &str)]) -> RequestContext {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        RequestContext::new(method, &map)
    }

    fn get(headers: &[(HeaderName, &str)]) -> Response {
        Ranged::new(context(Method::GET, headers), fixture()).respond()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        let mut stream = response.into_body().into_data_stream();
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await.transpose().unwrap() {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    fn header<'a>(response: &'a Response, name: HeaderName) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn full_response_invariant() {
        let response = get(&[]);
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(Some("1000"), header(&response, header::CONTENT_LENGTH));
        assert_eq!(Some("bytes"), header(&response, header::ACCEPT_RANGES));
        assert_eq!(Some("\"abc\""), header(&response, header::ETAG));
        assert_eq!(
            Some(httpdate::fmt_http_date(t0())).as_deref(),
            header(&response, header::LAST_MODIFIED),
        );
        assert_eq!(content(), body_bytes(response).await);
    }

    #[tokio::test]
    async fn simple_range() {
        let response = get(&[(header::RANGE, "bytes=0-499")]);
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!(Some("bytes 0-499/1000"), header(&response, header::CONTENT_RANGE));
        assert_eq!(Some("500"), header(&response, header::CONTENT_LENGTH));
        assert_eq!(&content()[0..500], body_bytes(response).await);
    }

    #[tokio::test]
    async fn suffix_range() {
        let response = get(&[(header::RANGE, "bytes=-100")]);
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!(Some("bytes 900-999/1000"), header(&response, header::CONTENT_RANGE));
        assert_eq!(&content()[900..], body_bytes(response).await);
    }

    #[tokio::test]
    async fn open_ended_range() {
        let response = get(&[(header::RANGE, "bytes=500-")]);
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!(Some("bytes 500-999/1000"), header(&response, header::CONTENT_RANGE));
        assert_eq!(Some("500"), header(&response, header::CONTENT_LENGTH));
        assert_eq!(&content()[500..], body_bytes(response).await);
    }

    #[tokio::test]
    async fn out_of_bounds_range_is_bad_request() {
        let response = get(&[(header::RANGE, "bytes=1000-1001")]);
        assert_eq!(StatusCode::BAD_REQUEST, response.status());
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn exclusive_end_position_is_tolerated() {
        let response = get(&[(header::RANGE, "bytes=0-1000")]);
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!(Some("bytes 0-999/1000"), header(&response, header::CONTENT_RANGE));
    }

    #[tokio::test]
    async fn if_none_match_hit_echoes_etag() {
        let response = get(&[(header::IF_NONE_MATCH, "\"abc\"")]);
        assert_eq!(StatusCode::NOT_MODIFIED, response.status());
        assert_eq!(Some("\"abc\""), header(&response, header::ETAG));
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn if_unmodified_since_before_t0_fails() {
        let date = httpdate::fmt_http_date(t0() - Duration::from_secs(3600));
        let response = get(&[(header::IF_UNMODIFIED_SINCE, &date)]);
        assert_eq!(StatusCode::PRECONDITION_FAILED, response.status());
    }

    #[tokio::test]
    async fn if_range_mismatch_serves_entire_entity() {
        let response = get(&[
            (header::RANGE, "bytes=0-499"),
            (header::IF_RANGE, "\"zzz\""),
        ]);
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(None, header(&response, header::CONTENT_RANGE));
        assert_eq!(Some("1000"), header(&response, header::CONTENT_LENGTH));
        assert_eq!(content(), body_bytes(response).await);
    }

    #[tokio::test]
    async fn date_typed_if_range_serves_entire_entity() {
        // a date validator never matches the entity tag, so partial
        // delivery is abandoned in favor of the full resource
        let response = get(&[
            (header::RANGE, "bytes=0-499"),
            (header::IF_RANGE, "Tue, 15 Nov 1994 08:12:31 GMT"),
        ]);
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(None, header(&response, header::CONTENT_RANGE));
        assert_eq!(content(), body_bytes(response).await);
    }

    #[tokio::test]
    async fn multipart_response_has_one_part_per_range() {
        let response = get(&[(header::RANGE, "bytes=0-9,500-509,990-999")]);
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());

        let content_type = header(&response, header::CONTENT_TYPE).unwrap().to_owned();
        assert_eq!(
            format!("multipart/byteranges; boundary={MULTIPART_BOUNDARY}"),
            content_type,
        );

        let declared: usize = header(&response, header::CONTENT_LENGTH)
            .unwrap()
            .parse()
            .unwrap();

        let stream = response.into_body().into_data_stream();
        let mut multipart = multer::Multipart::new(stream, MULTIPART_BOUNDARY);

        let source = content();
        let expected = [(0usize, 10usize), (500, 510), (990, 1000)];
        let mut parts = 0;
        let mut emitted = 0usize;
        while let Some(field) = multipart.next_field().await.unwrap() {
            let content_range = field
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .unwrap()
                .to_owned();
            let (start, end) = expected[parts];
            assert_eq!(
                format!("bytes {}-{}/1000", start, end - 1),
                content_range,
            );

            let bytes = field.bytes().await.unwrap();
            assert_eq!(&source[start..end], &bytes[..]);
            emitted += bytes.len();
            parts += 1;
        }
        assert_eq!(3, parts);
        // declared length covers part framing as well as the byte spans
        assert!(declared > emitted);
    }

    #[tokio::test]
    async fn multipart_content_length_matches_body() {
        let response = get(&[(header::RANGE, "bytes=0-9,500-509")]);
        let declared: usize = header(&response, header::CONTENT_LENGTH)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body_bytes(response).await.len());
    }

    #[tokio::test]
    async fn repeated_requests_are_idempotent() {
        let first = get(&[(header::RANGE, "bytes=100-199")]);
        let second = get(&[(header::RANGE, "bytes=100-199")]);

        assert_eq!(
            header(&first, header::ETAG).map(str::to_owned),
            header(&second, header::ETAG).map(str::to_owned),
        );
        assert_eq!(
            header(&first, header::LAST_MODIFIED).map(str::to_owned),
            header(&second, header::LAST_MODIFIED).map(str::to_owned),
        );
        assert_eq!(body_bytes(first).await, body_bytes(second).await);
    }

    #[tokio::test]
    async fn tiling_ranges_reconstruct_the_resource() {
        let mut rebuilt = Vec::new();
        for range in ["bytes=0-249", "bytes=250-499", "bytes=500-749", "bytes=750-999"] {
            let response = get(&[(header::RANGE, range)]);
            assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
            rebuilt.extend(body_bytes(response).await);
        }
        assert_eq!(content(), rebuilt);
    }

    #[tokio::test]
    async fn head_suppresses_body_on_every_path() {
        let full = Ranged::new(context(Method::HEAD, &[]), fixture()).respond();
        assert_eq!(StatusCode::OK, full.status());
        assert_eq!(Some("1000"), header(&full, header::CONTENT_LENGTH));
        assert!(body_bytes(full).await.is_empty());

        let single = Ranged::new(
            context(Method::HEAD, &[(header::RANGE, "bytes=0-499")]),
            fixture(),
        )
        .respond();
        assert_eq!(StatusCode::PARTIAL_CONTENT, single.status());
        assert_eq!(Some("bytes 0-499/1000"), header(&single, header::CONTENT_RANGE));
        assert_eq!(Some("500"), header(&single, header::CONTENT_LENGTH));
        assert!(body_bytes(single).await.is_empty());

        let multi = Ranged::new(
            context(Method::HEAD, &[(header::RANGE, "bytes=0-9,20-29")]),
            fixture(),
        )
        .respond();
        assert_eq!(StatusCode::PARTIAL_CONTENT, multi.status());
        assert!(body_bytes(multi).await.is_empty());
    }

    #[tokio::test]
    async fn non_get_method_is_not_implemented() {
        let response = Ranged::new(context(Method::POST, &[]), fixture()).respond();
        assert_eq!(StatusCode::NOT_IMPLEMENTED, response.status());
    }

    struct Denied(MemoryResource);

    impl MediaResource for Denied {
        type Body = io::Cursor<Vec<u8>>;

        fn descriptor(&self) -> &ResourceDescriptor {
            self.0.descriptor()
        }

        fn is_authorized(&self, _ctx: &RequestContext) -> bool {
            false
        }

        fn into_body(self) -> Self::Body {
            self.0.into_body()
        }
    }

    #[tokio::test]
    async fn unauthorized_request_gets_minimal_html() {
        let response = Ranged::new(context(Method::GET, &[]), Denied(fixture())).respond();
        assert_eq!(StatusCode::FORBIDDEN, response.status());
        let body = body_bytes(response).await;
        assert_eq!(UNAUTHORIZED_BODY.as_bytes(), &body[..]);
    }

    struct Missing(MemoryResource);

    impl MediaResource for Missing {
        type Body = io::Cursor<Vec<u8>>;

        fn descriptor(&self) -> &ResourceDescriptor {
            self.0.descriptor()
        }

        fn exists(&self, _ctx: &RequestContext) -> bool {
            false
        }

        fn into_body(self) -> Self::Body {
            self.0.into_body()
        }
    }

    struct Oversized(ResourceDescriptor);

    impl Oversized {
        fn new() -> Self {
            Oversized(ResourceDescriptor {
                length: i64::MAX as u64 + 1,
                last_modified: None,
                entity_tag: None,
                mime_type: "application/octet-stream".to_owned(),
                file_name: None,
            })
        }
    }

    impl MediaResource for Oversized {
        type Body = io::Cursor<Vec<u8>>;

        fn descriptor(&self) -> &ResourceDescriptor {
            &self.0
        }

        fn into_body(self) -> Self::Body {
            io::Cursor::new(Vec::new())
        }
    }

    #[tokio::test]
    async fn entity_too_large_is_413() {
        let response = Ranged::new(context(Method::GET, &[]), Oversized::new()).respond();
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, response.status());
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn oversized_range_request_is_also_413() {
        let ctx = context(Method::GET, &[(header::RANGE, "bytes=0-499")]);
        let response = Ranged::new(ctx, Oversized::new()).respond();
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, response.status());
    }

    #[tokio::test]
    async fn missing_resource_is_not_found() {
        let response = Ranged::new(context(Method::GET, &[]), Missing(fixture())).respond();
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn content_disposition_names_the_file() {
        let resource = fixture().with_file_name("summer photo.jpg");
        let response = Ranged::new(context(Method::GET, &[]), resource).respond();
        assert_eq!(
            Some("inline; filename=\"summer photo.jpg\""),
            header(&response, header::CONTENT_DISPOSITION),
        );
    }

    #[tokio::test]
    async fn internet_explorer_gets_percent_encoded_spaces() {
        let resource = fixture().with_file_name("summer photo.jpg");
        let ua = "Mozilla/4.0 (compatible; MSIE 7.0; Windows NT 6.0)";
        let ctx = context(Method::GET, &[(header::USER_AGENT, ua)]);
        let response = Ranged::with_options(
            ctx,
            resource,
            ServeOptions { disposition: Disposition::Attachment, ..Default::default() },
        )
        .respond();
        assert_eq!(
            Some("attachment; filename=\"summer%20photo.jpg\""),
            header(&response, header::CONTENT_DISPOSITION),
        );
    }

    #[tokio::test]
    async fn empty_resource_serves_empty_full_entity() {
        let resource = MemoryResource::new(Vec::new(), "text/plain");
        let response = Ranged::new(context(Method::GET, &[]), resource).respond();
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(Some("0"), header(&response, header::CONTENT_LENGTH));
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn small_chunk_size_still_delivers_exact_span() {
        let options = ServeOptions { chunk_size: 64, ..Default::default() };
        let ctx = context(Method::GET, &[(header::RANGE, "bytes=0-499")]);
        let response = Ranged::with_options(ctx, fixture(), options).respond();
        assert_eq!(&content()[0..500], body_bytes(response).await);
    }
}
