//! Observation hooks the core calls around requests and attempts.
//!
//! The default listener is a no-op, keeping the hot path branch-free in
//! spirit: calls devolve to empty inlined bodies.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{ExecutionError, RequestAttemptError};
use crate::policies::retry::RetryDecision;

/// Identifies one caller-visible request across its hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Identifies one attempt (one request on one target) within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(pub u64);

/// Lifecycle hooks of requests and their per-target attempts.
///
/// Implementations must be cheap and non-blocking; they run inline on
/// the request path.
pub trait RequestListener: Send + Sync + fmt::Debug {
    fn on_request_start(&self, _request_id: RequestId) {}
    fn on_request_success(&self, _request_id: RequestId) {}
    fn on_request_failure(&self, _request_id: RequestId, _error: &ExecutionError) {}

    fn on_attempt_start(&self, _request_id: RequestId, _attempt_id: AttemptId, _node: SocketAddr) {
    }
    fn on_attempt_success(&self, _attempt_id: AttemptId) {}
    fn on_attempt_error(
        &self,
        _attempt_id: AttemptId,
        _error: &RequestAttemptError,
        _retry_decision: &RetryDecision,
    ) {
    }
}

/// The default listener: observes nothing.
#[derive(Debug, Default)]
pub struct NoopRequestListener;

impl RequestListener for NoopRequestListener {}

/// Allocates request and attempt ids; one per session.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    next_request: AtomicU64,
    next_attempt: AtomicU64,
}

impl IdAllocator {
    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_attempt_id(&self) -> AttemptId {
        AttemptId(self.next_attempt.fetch_add(1, Ordering::Relaxed))
    }
}
