//! The per-session prepared-statement cache.
//!
//! Keyed by (keyspace, CQL text); the session identity is the cache
//! instance itself, so two sessions never share entries. Preparation is
//! single-flight: concurrent requests for the same key await one
//! in-flight PREPARE and share its outcome. Failures are delivered to
//! everyone who was waiting but never cached, so the next caller
//! retries.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::trace;

use crate::errors::PrepareError;
use crate::statement::PreparedStatement;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    keyspace: Option<String>,
    cql: String,
}

type PrepareOutcome = Result<Arc<PreparedStatement>, PrepareError>;

#[derive(Clone)]
enum Flight {
    Ready(Arc<PreparedStatement>),
    /// The receiver resolves to the in-flight preparation's outcome.
    Preparing(watch::Receiver<Option<PrepareOutcome>>),
}

#[derive(Default)]
pub(crate) struct PreparedCache {
    cache: DashMap<CacheKey, Flight>,
}

impl PreparedCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the cached prepared statement for (keyspace, cql), or
    /// prepares it with `prepare_fn`, making sure at most one
    /// preparation per key is in flight.
    pub(crate) async fn get_or_prepare<F, Fut>(
        &self,
        keyspace: Option<String>,
        cql: &str,
        prepare_fn: F,
    ) -> PrepareOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PrepareOutcome>,
    {
        let key = CacheKey {
            keyspace,
            cql: cql.to_owned(),
        };

        let mut prepare_fn = Some(prepare_fn);
        loop {
            // Decide synchronously what role this call plays; never hold
            // a map guard across an await.
            enum Role {
                Hit(Arc<PreparedStatement>),
                Waiter(watch::Receiver<Option<PrepareOutcome>>),
                Preparer(watch::Sender<Option<PrepareOutcome>>),
            }

            let role = match self.cache.entry(key.clone()) {
                Entry::Occupied(occupied) => match occupied.get() {
                    Flight::Ready(prepared) => Role::Hit(prepared.clone()),
                    Flight::Preparing(receiver) => Role::Waiter(receiver.clone()),
                },
                Entry::Vacant(vacant) => {
                    let (sender, receiver) = watch::channel(None);
                    vacant.insert(Flight::Preparing(receiver));
                    Role::Preparer(sender)
                }
            };

            match role {
                Role::Hit(prepared) => return Ok(prepared),
                Role::Waiter(mut receiver) => {
                    loop {
                        if let Some(outcome) = receiver.borrow_and_update().clone() {
                            // Callers that overlapped the flight share its
                            // outcome, success or failure.
                            return outcome;
                        }
                        if receiver.changed().await.is_err() {
                            // The preparer was cancelled before resolving.
                            // Clear the stale flight and start over.
                            self.remove_stale_flight(&key);
                            break;
                        }
                    }
                }
                Role::Preparer(sender) => {
                    let prepare_fn = prepare_fn
                        .take()
                        .expect("a caller becomes the preparer at most once");
                    let outcome = CancelGuard {
                        cache: self,
                        key: &key,
                        armed: true,
                    }
                    .run(prepare_fn()).await;

                    match &outcome {
                        Ok(prepared) => {
                            trace!("Cached prepared statement for {:?}", key.cql);
                            self.cache.insert(key.clone(), Flight::Ready(prepared.clone()));
                        }
                        Err(_) => {
                            // Failures are not cached; remove the flight
                            // so the next caller retries.
                            self.remove_stale_flight(&key);
                        }
                    }
                    let _ = sender.send(Some(outcome.clone()));
                    return outcome;
                }
            }
        }
    }

    fn remove_stale_flight(&self, key: &CacheKey) {
        self.cache
            .remove_if(key, |_, flight| matches!(flight, Flight::Preparing(_)));
    }

    /// All cached prepared statements, e.g. for repreparing after a node
    /// comes back up.
    pub(crate) fn cached_statements(&self) -> Vec<Arc<PreparedStatement>> {
        self.cache
            .iter()
            .filter_map(|entry| match entry.value() {
                Flight::Ready(prepared) => Some(prepared.clone()),
                Flight::Preparing(_) => None,
            })
            .collect()
    }
}

/// Removes the in-flight marker if the preparer future is dropped before
/// resolving, so waiters do not hang on a flight nobody is flying.
struct CancelGuard<'a> {
    cache: &'a PreparedCache,
    key: &'a CacheKey,
    armed: bool,
}

impl CancelGuard<'_> {
    async fn run<Fut>(mut self, fut: Fut) -> PrepareOutcome
    where
        Fut: Future<Output = PrepareOutcome>,
    {
        let outcome = fut.await;
        self.armed = false;
        outcome
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.remove_stale_flight(self.key);
        }
    }
}
