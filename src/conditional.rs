//! The conditional request pipeline.
//!
//! A fixed, ordered list of stage functions, each inspecting the request
//! context and resource metadata and voting `Continue` or a final
//! disposition. The driver stops at the first non-`Continue` vote, which
//! makes the original early-return control flow an explicit, testable
//! state machine.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{Method, StatusCode};

use crate::context::RequestContext;
use crate::range::{RangeError, RangePlan};
use crate::resource::{MediaResource, ResourceDescriptor};

/// The largest entity a signed `Content-Length` consumer can represent.
const MAX_RESPONSE_LENGTH: u64 = i64::MAX as u64;

/// Verdict of the pipeline (or of a single stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not decided yet; serve whatever the range plan says.
    Continue,
    /// `If-Range` validator mismatch: fall back to the entire entity
    /// with a 200. Not an error.
    ServeFull,
    /// A cache validator matched; 304 with no body.
    NotModified,
    /// Short-circuit with this status and no entity body.
    Fail(StatusCode),
}

pub(crate) struct Pipeline<'a, R: MediaResource> {
    pub ctx: &'a RequestContext,
    pub resource: &'a R,
    pub plan: &'a Result<RangePlan, RangeError>,
}

impl<'a, R: MediaResource> Pipeline<'a, R> {
    /// Run every stage in order, stopping at the first decisive vote.
    pub fn run(&self) -> Outcome {
        let stages: [(&str, fn(&Self) -> Outcome); 9] = [
            ("authorization", Self::authorize),
            ("method", Self::check_method),
            ("resource", Self::check_resource),
            ("range-sanity", Self::check_ranges),
            ("if-modified-since", Self::check_modified_since),
            ("if-unmodified-since", Self::check_unmodified_since),
            ("if-match", Self::check_if_match),
            ("if-none-match", Self::check_if_none_match),
            ("if-range", Self::check_if_range),
        ];

        for (name, stage) in stages {
            let outcome = stage(self);
            if outcome != Outcome::Continue {
                tracing::debug!(stage = name, ?outcome, "conditional pipeline short-circuited");
                return outcome;
            }
        }
        Outcome::Continue
    }

    fn descriptor(&self) -> &ResourceDescriptor {
        self.resource.descriptor()
    }

    fn authorize(&self) -> Outcome {
        if self.resource.is_authorized(self.ctx) {
            Outcome::Continue
        } else {
            Outcome::Fail(StatusCode::FORBIDDEN)
        }
    }

    fn check_method(&self) -> Outcome {
        match *self.ctx.method() {
            Method::GET | Method::HEAD => Outcome::Continue,
            _ => Outcome::Fail(StatusCode::NOT_IMPLEMENTED),
        }
    }

    fn check_resource(&self) -> Outcome {
        if !self.resource.exists(self.ctx) {
            return Outcome::Fail(StatusCode::NOT_FOUND);
        }
        if self.descriptor().length > MAX_RESPONSE_LENGTH {
            return Outcome::Fail(StatusCode::PAYLOAD_TOO_LARGE);
        }
        Outcome::Continue
    }

    fn check_ranges(&self) -> Outcome {
        match self.plan {
            Ok(_) => Outcome::Continue,
            Err(error) => {
                tracing::debug!(?error, "rejecting range header");
                Outcome::Fail(StatusCode::BAD_REQUEST)
            }
        }
    }

    fn check_modified_since(&self) -> Outcome {
        let Some(modified) = self.descriptor().last_modified else {
            return Outcome::Continue;
        };
        let Some(threshold) = self.ctx.if_modified_since().and_then(parse_http_date) else {
            return Outcome::Continue;
        };
        if truncate_to_seconds(modified) <= threshold {
            Outcome::NotModified
        } else {
            Outcome::Continue
        }
    }

    /// `If-Unmodified-Since` and its legacy spelling
    /// `Unless-Modified-Since`. An unparsable date never fails the
    /// request; the precondition is simply treated as satisfied.
    fn check_unmodified_since(&self) -> Outcome {
        let Some(modified) = self.descriptor().last_modified else {
            return Outcome::Continue;
        };
        let headers = [
            self.ctx.if_unmodified_since(),
            self.ctx.unless_modified_since(),
        ];
        for threshold in headers.into_iter().flatten().filter_map(parse_http_date) {
            if truncate_to_seconds(modified) > threshold {
                return Outcome::Fail(StatusCode::PRECONDITION_FAILED);
            }
        }
        Outcome::Continue
    }

    fn check_if_match(&self) -> Outcome {
        let Some(header) = self.ctx.if_match() else {
            return Outcome::Continue;
        };
        if header.trim() == "*" {
            return Outcome::Continue;
        }
        if self.current_tag_in(header) {
            Outcome::Continue
        } else {
            Outcome::Fail(StatusCode::PRECONDITION_FAILED)
        }
    }

    fn check_if_none_match(&self) -> Outcome {
        let Some(header) = self.ctx.if_none_match() else {
            return Outcome::Continue;
        };
        // `*` alongside a GET asserts nothing can match while asking for
        // the entity anyway; the request contradicts itself
        if header.trim() == "*" {
            return Outcome::Fail(StatusCode::PRECONDITION_FAILED);
        }
        if self.current_tag_in(header) {
            Outcome::NotModified
        } else {
            Outcome::Continue
        }
    }

    /// Only consulted for genuine range requests. A stale validator
    /// silently downgrades the request to the full entity rather than
    /// failing it.
    fn check_if_range(&self) -> Outcome {
        let is_range_request = matches!(self.plan, Ok(plan) if plan.is_range_request);
        if !is_range_request {
            return Outcome::Continue;
        }
        let Some(header) = self.ctx.if_range() else {
            return Outcome::Continue;
        };
        match self.descriptor().entity_tag.as_deref() {
            Some(tag) if tag_matches(header, tag) => Outcome::Continue,
            _ => Outcome::ServeFull,
        }
    }

    /// Whether the resource's current entity tag appears in a
    /// comma-separated validator list.
    fn current_tag_in(&self, header: &str) -> bool {
        let Some(tag) = self.descriptor().entity_tag.as_deref() else {
            return false;
        };
        header.split(',').any(|candidate| tag_matches(candidate, tag))
    }
}

/// Compare one validator from a header against the descriptor's
/// (unquoted) entity tag, ignoring quoting and a `W/` weakness prefix.
fn tag_matches(candidate: &str, tag: &str) -> bool {
    let candidate = candidate.trim();
    let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
    let candidate = candidate
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(candidate);
    candidate == tag
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value).ok()
}

/// HTTP dates carry whole-second resolution, so the resource's
/// modification time is truncated before comparison.
fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()),
        Err(_) => time,
    }
}
