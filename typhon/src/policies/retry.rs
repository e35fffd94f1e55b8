//! Retry policies: deciding what to do with a failed request attempt.

use crate::errors::{DbError, RequestAttemptError, WriteType};
use typhon_cql::Consistency;

/// The decision a retry session makes about a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same target, optionally at a new consistency.
    RetrySameTarget(Option<Consistency>),
    /// Retry on the next target in the query plan, optionally at a new
    /// consistency.
    RetryNextTarget(Option<Consistency>),
    DontRetry,
    /// Pretend the (write) request succeeded.
    IgnoreWriteError,
}

/// Everything a retry session may consult about a failed attempt.
#[derive(Debug)]
pub struct RequestInfo<'a> {
    pub error: &'a RequestAttemptError,
    pub is_idempotent: bool,
    pub consistency: Consistency,
}

/// A factory of per-request [`RetrySession`]s.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Per-request retry state. A fresh session is created for every request,
/// so "retry at most once" counters are per-request.
pub trait RetrySession: Send + Sync {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Resets the session, for reuse by speculative fibers.
    fn reset(&mut self);
}

/// Retries when there is a high chance that a retry might help.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::default())
    }
}

#[derive(Default)]
struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if request_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        }
        match request_info.error {
            // Node-local trouble; another node may be healthy.
            RequestAttemptError::Broken(_)
            | RequestAttemptError::ConnectionClosed
            | RequestAttemptError::Db(DbError::Overloaded, _)
            | RequestAttemptError::Db(DbError::ServerError, _)
            | RequestAttemptError::Db(DbError::TruncateError, _) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The coordinator believes too few replicas are alive; that
            // view may be local to it. One shot at a different node.
            RequestAttemptError::Db(DbError::Unavailable { .. }, _) => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Enough replicas answered but only with digests; the retried
            // read should find the dead replicas marked down.
            RequestAttemptError::Db(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                if !self.was_read_timeout_retry && received >= required && !*data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Only the batch-log write is safe to redo.
            RequestAttemptError::Db(DbError::WriteTimeout { write_type, .. }, _) => {
                if !self.was_write_timeout_retry
                    && request_info.is_idempotent
                    && *write_type == WriteType::BatchLog
                {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            RequestAttemptError::Db(DbError::IsBootstrapping, _) => {
                RetryDecision::RetryNextTarget(None)
            }
            RequestAttemptError::UnableToAllocStreamId => RetryDecision::RetryNextTarget(None),
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::default();
    }
}

/// Never retries; every error surfaces to the caller unchanged.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    pub fn new() -> Self {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

struct FallthroughRetrySession;

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BrokenConnectionErrorKind;
    use typhon_cql::Consistency;

    fn info(error: &RequestAttemptError, is_idempotent: bool) -> RequestInfo<'_> {
        RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::LocalQuorum,
        }
    }

    #[test]
    fn broken_connection_retries_only_idempotent() {
        let error =
            RequestAttemptError::Broken(BrokenConnectionErrorKind::ChannelError.into());

        let mut session = DefaultRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut session = DefaultRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, true)),
            RetryDecision::RetryNextTarget(None)
        );
    }

    #[test]
    fn unavailable_retries_once_on_next_target() {
        let error = RequestAttemptError::Db(
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            },
            "".to_owned(),
        );
        let mut session = DefaultRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::RetryNextTarget(None)
        );
        assert_eq!(
            session.decide_should_retry(info(&error, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn read_timeout_retry_needs_digests_only() {
        let digests_only = RequestAttemptError::Db(
            DbError::ReadTimeout {
                consistency: Consistency::Quorum,
                received: 2,
                required: 2,
                data_present: false,
            },
            "".to_owned(),
        );
        let mut session = DefaultRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&digests_only, false)),
            RetryDecision::RetrySameTarget(None)
        );

        let with_data = RequestAttemptError::Db(
            DbError::ReadTimeout {
                consistency: Consistency::Quorum,
                received: 2,
                required: 2,
                data_present: true,
            },
            "".to_owned(),
        );
        let mut session = DefaultRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&with_data, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn write_timeout_retry_needs_idempotent_batchlog() {
        let batch_log = RequestAttemptError::Db(
            DbError::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                write_type: WriteType::BatchLog,
            },
            "".to_owned(),
        );
        let mut session = DefaultRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&batch_log, true)),
            RetryDecision::RetrySameTarget(None)
        );

        let mut session = DefaultRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&batch_log, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn serial_consistency_never_retries() {
        let error = RequestAttemptError::Db(DbError::IsBootstrapping, "".to_owned());
        let mut session = DefaultRetryPolicy.new_session();
        let decision = session.decide_should_retry(RequestInfo {
            error: &error,
            is_idempotent: true,
            consistency: Consistency::Serial,
        });
        assert_eq!(decision, RetryDecision::DontRetry);
    }

    #[test]
    fn fallthrough_never_retries() {
        let error = RequestAttemptError::Db(DbError::IsBootstrapping, "".to_owned());
        let mut session = FallthroughRetryPolicy.new_session();
        assert_eq!(
            session.decide_should_retry(info(&error, true)),
            RetryDecision::DontRetry
        );
    }
}
