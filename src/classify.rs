//! Classification of raw HTTP failures into typed, retry-annotated outcomes.
//!
//! Workers consult the classifier when a fetch comes back with an error
//! status: a retryable kind feeds the job's retry budget via
//! [`crate::queue::JobStore::fail`], while a permanent kind goes straight to
//! [`crate::queue::JobStore::fail_permanently`] without burning budget on a
//! target that will never succeed (private, banned, quarantined, gone).
//!
//! Both [`ErrorKind::retryable`] and [`ErrorKind::is_permanent`] are fixed
//! tables over the kind, never derived from the individual response, so
//! callers can reason about them statically.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// The typed outcome of a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 429: the server is throttling us.
    RateLimited,
    /// Any 5xx.
    ServerError,
    /// 401: expected to resolve once the request factory refreshes the token.
    Unauthorized,
    /// 404 with `reason = "private"`.
    PrivateTarget,
    /// 404 with `reason = "banned"`.
    BannedTarget,
    /// 403 with `reason = "quarantined"`.
    Quarantined,
    /// 404 without a recognised reason.
    NotFound,
    /// 400.
    BadRequest,
    /// 403 without a recognised reason.
    Forbidden,
}

impl ErrorKind {
    /// Whether another attempt can reasonably change the outcome.
    pub const fn retryable(self) -> bool {
        match self {
            Self::RateLimited | Self::ServerError | Self::Unauthorized => true,
            Self::PrivateTarget
            | Self::BannedTarget
            | Self::Quarantined
            | Self::NotFound
            | Self::BadRequest
            | Self::Forbidden => false,
        }
    }

    /// Whether a job failing with this kind should be marked `failed`
    /// immediately instead of consuming retry budget.
    pub const fn is_permanent(self) -> bool {
        match self {
            Self::RateLimited | Self::ServerError | Self::Unauthorized => false,
            Self::PrivateTarget
            | Self::BannedTarget
            | Self::Quarantined
            | Self::NotFound
            | Self::BadRequest
            | Self::Forbidden => true,
        }
    }
}

/// A classified fetch failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} (status {status})")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub status: u16,
}

impl ClassifiedError {
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// The body shape carrying the server's refusal reason, e.g.
/// `{"reason": "banned"}`. Anything that fails to parse is treated as
/// carrying no hint.
#[derive(Debug, Deserialize)]
struct BodyHint {
    reason: Option<String>,
}

fn reason_hint(body: &str) -> Option<String> {
    serde_json::from_str::<BodyHint>(body).ok()?.reason
}

/// Maps a response's status and body to a [`ClassifiedError`].
///
/// Returns `None` for statuses outside the failure table (success, redirects,
/// and unlisted 4xx); callers treat those as unclassified and fall back to
/// plain retry-budget semantics.
pub fn classify(status: StatusCode, body: &str) -> Option<ClassifiedError> {
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::UNAUTHORIZED => ErrorKind::Unauthorized,
        StatusCode::BAD_REQUEST => ErrorKind::BadRequest,
        StatusCode::NOT_FOUND => match reason_hint(body).as_deref() {
            Some("private") => ErrorKind::PrivateTarget,
            Some("banned") => ErrorKind::BannedTarget,
            _ => ErrorKind::NotFound,
        },
        StatusCode::FORBIDDEN => match reason_hint(body).as_deref() {
            Some("quarantined") => ErrorKind::Quarantined,
            _ => ErrorKind::Forbidden,
        },
        status if status.is_server_error() => ErrorKind::ServerError,
        _ => return None,
    };
    Some(ClassifiedError {
        kind,
        status: status.as_u16(),
    })
}
