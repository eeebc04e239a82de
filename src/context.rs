//! Read-once view of the request headers the engine consumes.

use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::request::Parts;
use axum::http::Method;

/// The `Unless-Modified-Since` header predates `If-Unmodified-Since` and
/// is still sent by some legacy clients; both carry the same meaning.
static UNLESS_MODIFIED_SINCE: HeaderName = HeaderName::from_static("unless-modified-since");

/// Everything the engine needs to know about the request, captured once.
///
/// Header values are read a single time at construction and the context
/// is immutable afterwards, so no pipeline stage can observe a different
/// value than another.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    range: Option<String>,
    if_range: Option<String>,
    if_match: Option<String>,
    if_none_match: Option<String>,
    if_modified_since: Option<String>,
    if_unmodified_since: Option<String>,
    unless_modified_since: Option<String>,
    user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(method: Method, headers: &HeaderMap) -> Self {
        RequestContext {
            method,
            range: read(headers, &header::RANGE),
            if_range: read(headers, &header::IF_RANGE),
            if_match: read(headers, &header::IF_MATCH),
            if_none_match: read(headers, &header::IF_NONE_MATCH),
            if_modified_since: read(headers, &header::IF_MODIFIED_SINCE),
            if_unmodified_since: read(headers, &header::IF_UNMODIFIED_SINCE),
            unless_modified_since: read(headers, &UNLESS_MODIFIED_SINCE),
            user_agent: read(headers, &header::USER_AGENT),
        }
    }

    pub fn from_parts(parts: &Parts) -> Self {
        RequestContext::new(parts.method.clone(), &parts.headers)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    pub fn range(&self) -> Option<&str> {
        self.range.as_deref()
    }

    pub fn if_range(&self) -> Option<&str> {
        self.if_range.as_deref()
    }

    pub fn if_match(&self) -> Option<&str> {
        self.if_match.as_deref()
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.if_none_match.as_deref()
    }

    pub fn if_modified_since(&self) -> Option<&str> {
        self.if_modified_since.as_deref()
    }

    pub fn if_unmodified_since(&self) -> Option<&str> {
        self.if_unmodified_since.as_deref()
    }

    pub fn unless_modified_since(&self) -> Option<&str> {
        self.unless_modified_since.as_deref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }
}

fn read(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}
