//! Speculative execution: racing a second attempt against a slow one.

use futures::{
    future::FutureExt,
    stream::{FuturesUnordered, StreamExt},
};
use std::{future::Future, time::Duration};
use tracing::{trace_span, Instrument};

use crate::errors::{ExecutionError, RequestAttemptError};

/// Decides whether and when additional speculative attempts are started
/// while the original one is still in flight.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// The maximum number of speculative attempts for one request, not
    /// counting the initial one.
    fn max_retry_count(&self) -> usize;

    /// The delay before each additional attempt is started.
    fn retry_interval(&self) -> Duration;
}

/// Starts up to `max_retry_count` extra attempts, one every
/// `retry_interval`.
#[derive(Debug, Clone)]
pub struct SimpleSpeculativeExecutionPolicy {
    pub max_retry_count: usize,
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// Whether a fiber's error may be suppressed in favor of letting the
/// other fibers continue: true for errors local to the attempted node.
fn can_be_ignored<ResT>(result: &Result<ResT, ExecutionError>) -> bool {
    match result {
        Ok(_) => false,
        Err(ExecutionError::Pool(_)) => true,
        Err(ExecutionError::LastAttempt(e)) => matches!(
            e,
            RequestAttemptError::Broken(_)
                | RequestAttemptError::ConnectionClosed
                | RequestAttemptError::UnableToAllocStreamId
        ),
        Err(_) => false,
    }
}

/// Races the original attempt against speculative ones; the first
/// non-ignorable result wins and the losers are dropped (their stream
/// ids get orphaned and reclaimed by the connections). When every fiber
/// fails ignorably, the race ends with the last such error once the
/// attempt budget is spent.
pub(crate) async fn execute<QueryFut, ResT>(
    policy: &dyn SpeculativeExecutionPolicy,
    mut request_runner_generator: impl FnMut(bool) -> QueryFut,
) -> Result<ResT, ExecutionError>
where
    QueryFut: Future<Output = Option<Result<ResT, ExecutionError>>>,
{
    let mut retries_remaining = policy.max_retry_count();
    let retry_interval = policy.retry_interval();

    let mut async_tasks = FuturesUnordered::new();
    async_tasks.push(
        request_runner_generator(false)
            .instrument(trace_span!("Speculative execution: original request")),
    );

    let sleep = tokio::time::sleep(retry_interval).fuse();
    tokio::pin!(sleep);

    let mut last_error = None;
    loop {
        futures::select! {
            _ = &mut sleep => {
                if retries_remaining > 0 {
                    async_tasks.push(
                        request_runner_generator(true)
                            .instrument(trace_span!("Speculative execution")),
                    );
                    retries_remaining -= 1;
                    sleep.set(tokio::time::sleep(retry_interval).fuse());
                }
            }
            result = async_tasks.select_next_some() => {
                match result {
                    Some(result) => {
                        if async_tasks.is_empty() && retries_remaining == 0 {
                            return result;
                        }
                        if !can_be_ignored(&result) {
                            return result;
                        }
                        if let Err(error) = result {
                            last_error = Some(error);
                        }
                    }
                    None => {
                        // The fiber's plan was empty.
                        if async_tasks.is_empty() && retries_remaining == 0 {
                            return Err(last_error.unwrap_or(ExecutionError::EmptyPlan));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use crate::errors::ConnectionPoolError;
    use futures::future::BoxFuture;

    fn policy(max_retry_count: usize) -> SimpleSpeculativeExecutionPolicy {
        SimpleSpeculativeExecutionPolicy {
            max_retry_count,
            retry_interval: Duration::from_millis(10),
        }
    }

    type RunnerFuture = BoxFuture<'static, Option<Result<u32, ExecutionError>>>;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn fastest_fiber_wins() {
        let mut calls = 0u32;
        let result = execute(&policy(1), move |_is_speculative| -> RunnerFuture {
            calls += 1;
            if calls == 1 {
                // The original attempt hangs on a slow node.
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Some(Ok(1u32))
                })
            } else {
                Box::pin(async { Some(Ok(2u32)) })
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn ignorable_errors_on_every_fiber_end_the_race() {
        // Every fiber fails with a node-local error the racer may
        // suppress while others are still in flight. Once the original
        // and all speculative fibers have failed this way, the race must
        // resolve with that error instead of hanging or panicking on an
        // empty fiber set.
        let result: Result<u32, _> = execute(&policy(2), |_is_speculative| -> RunnerFuture {
            Box::pin(async {
                Some(Err(ExecutionError::Pool(ConnectionPoolError::Initializing)))
            })
        })
        .await;

        assert_matches!(
            result,
            Err(ExecutionError::Pool(ConnectionPoolError::Initializing))
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_plans_on_every_fiber_return_empty_plan() {
        let result: Result<u32, _> = execute(&policy(2), |_is_speculative| -> RunnerFuture {
            Box::pin(async { None })
        })
        .await;

        assert_matches!(result, Err(ExecutionError::EmptyPlan));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn non_ignorable_error_resolves_immediately() {
        let mut calls = 0u32;
        let result: Result<u32, _> =
            execute(&policy(3), move |_is_speculative| -> RunnerFuture {
                calls += 1;
                if calls == 1 {
                    Box::pin(async { Some(Err(ExecutionError::EmptyPlan)) })
                } else {
                    // Never reached: the first error is decisive.
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Some(Ok(1u32))
                    })
                }
            })
            .await;

        assert_matches!(result, Err(ExecutionError::EmptyPlan));
    }
}
