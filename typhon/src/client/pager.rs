//! The lazy, paged result stream.
//!
//! A background worker fetches pages one at a time and pushes them into
//! a bounded channel; the consumer-side [`QueryPager`] yields rows from
//! the buffered page and blocks on the channel when it runs out. The
//! next page is requested with the same statement and options plus the
//! paging state the previous page returned. On protocol v5 a page may
//! carry new result metadata after a schema change; the pager switches
//! to the new column set transparently.

use std::future::Future;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::trace;

use crate::errors::{ExecutionError, NextPageError, NextRowError};
use crate::response::{PagingState, QueryResult};
use typhon_cql::frame::request::query::PagingStateResponse;
use typhon_cql::frame::response::result::Row;
use typhon_cql::value::ColumnSpec;

/// One page as handed from the worker to the consumer.
struct ReceivedPage {
    rows: Vec<Row>,
    /// Present when the column set changed (or on the first page).
    col_specs: Option<Vec<ColumnSpec>>,
    /// Where the result set resumes after this page.
    paging_state_response: PagingStateResponse,
}

/// Fetches one page at the given paging state. Implemented by the
/// session for queries, executes and single connections; tests script
/// it directly.
pub(crate) trait PageFetcher: Send + 'static {
    type Fut: Future<Output = Result<QueryResult, ExecutionError>> + Send;

    fn fetch(&mut self, paging_state: PagingState) -> Self::Fut;
}

impl<F, Fut> PageFetcher for F
where
    F: FnMut(PagingState) -> Fut + Send + 'static,
    Fut: Future<Output = Result<QueryResult, ExecutionError>> + Send,
{
    type Fut = Fut;

    fn fetch(&mut self, paging_state: PagingState) -> Fut {
        (self)(paging_state)
    }
}

struct PagerWorker<F> {
    fetcher: F,
    sender: mpsc::Sender<Result<ReceivedPage, NextPageError>>,
    /// With auto-paging off the worker stops after the first page; the
    /// consumer resumes manually with the returned paging state.
    auto_page: bool,
}

impl<F: PageFetcher> PagerWorker<F> {
    async fn work(mut self, mut paging_state: PagingState) {
        let mut known_specs: Vec<ColumnSpec> = Vec::new();
        let mut first_page = true;

        loop {
            let result = self.fetcher.fetch(paging_state.clone()).await;
            let query_result = match result {
                Ok(query_result) => query_result,
                Err(error) => {
                    let _ = self.sender.send(Err(error.into())).await;
                    return;
                }
            };

            let specs_changed = first_page
                || (!query_result.col_specs().is_empty()
                    && query_result.col_specs() != known_specs.as_slice());
            if specs_changed {
                known_specs = query_result.col_specs().to_vec();
            }
            first_page = false;

            let paging_state_response = query_result.paging_state_response().clone();
            let page = ReceivedPage {
                rows: query_result.into_rows(),
                col_specs: specs_changed.then(|| known_specs.clone()),
                paging_state_response: paging_state_response.clone(),
            };

            if self.sender.send(Ok(page)).await.is_err() {
                // Consumer dropped the pager; stop fetching.
                return;
            }

            if !self.auto_page {
                return;
            }

            match paging_state_response.into_paging_control_flow() {
                std::ops::ControlFlow::Continue(next_state) => {
                    trace!("Pager fetching the next page");
                    paging_state = next_state;
                }
                std::ops::ControlFlow::Break(()) => return,
            }
        }
    }
}

/// A lazy, single-pass stream of rows that fetches subsequent pages on
/// demand. Not meant for concurrent consumption; create one pager per
/// consumer.
pub struct QueryPager {
    current_page: std::vec::IntoIter<Row>,
    page_receiver: mpsc::Receiver<Result<ReceivedPage, NextPageError>>,
    col_specs: Vec<ColumnSpec>,
    paging_state_response: PagingStateResponse,
    _worker_handle: RemoteHandle<()>,
}

impl QueryPager {
    /// Spawns the worker and waits for the first page, so construction
    /// surfaces immediate errors (bad statement, no hosts) eagerly.
    pub(crate) async fn new(
        fetcher: impl PageFetcher,
        initial_paging_state: PagingState,
        auto_page: bool,
    ) -> Result<Self, NextPageError> {
        // One page of lookahead: the worker fetches the next page while
        // the consumer drains the current one.
        let (sender, mut receiver) = mpsc::channel(1);

        let worker = PagerWorker {
            fetcher,
            sender,
            auto_page,
        };
        let (fut, handle) = worker.work(initial_paging_state).remote_handle();
        tokio::spawn(fut);

        let first_page = match receiver.recv().await {
            Some(Ok(page)) => page,
            Some(Err(error)) => return Err(error),
            None => return Err(NextPageError::WorkerGone),
        };

        Ok(Self {
            current_page: first_page.rows.into_iter(),
            col_specs: first_page.col_specs.unwrap_or_default(),
            paging_state_response: first_page.paging_state_response,
            page_receiver: receiver,
            _worker_handle: handle,
        })
    }

    /// The column specs of the rows currently being yielded. May change
    /// across page boundaries on protocol v5 after a schema change.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    /// Where the last delivered page left off. With auto-paging off,
    /// this is the state to resume with.
    pub fn paging_state_response(&self) -> &PagingStateResponse {
        &self.paging_state_response
    }

    /// Yields the next row, fetching the next page when the buffered one
    /// is exhausted. `None` ends the stream.
    pub async fn next_row(&mut self) -> Option<Result<Row, NextRowError>> {
        loop {
            if let Some(row) = self.current_page.next() {
                return Some(Ok(row));
            }

            match self.page_receiver.recv().await {
                Some(Ok(page)) => {
                    if let Some(col_specs) = page.col_specs {
                        self.col_specs = col_specs;
                    }
                    self.paging_state_response = page.paging_state_response;
                    self.current_page = page.rows.into_iter();
                }
                Some(Err(error)) => return Some(Err(error.into())),
                // Worker finished: no more pages.
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use typhon_cql::value::{ColumnType, CqlValue, TableSpec};

    fn int_row(i: i32) -> Row {
        Row {
            columns: vec![Some(CqlValue::Int(i))],
        }
    }

    fn col_specs(names: &[&str]) -> Vec<ColumnSpec> {
        names
            .iter()
            .map(|name| ColumnSpec {
                table_spec: TableSpec::new("ks", "t"),
                name: (*name).to_owned(),
                typ: ColumnType::Int,
            })
            .collect()
    }

    /// A fetcher scripted with a fixed sequence of pages; asserts it is
    /// resumed with exactly the paging states it handed out.
    fn scripted_fetcher(
        pages: Vec<(Vec<Row>, Vec<ColumnSpec>)>,
    ) -> impl PageFetcher {
        let total = pages.len();
        let mut pages = pages.into_iter().enumerate();
        move |paging_state: PagingState| {
            let next = pages.next();
            std::future::ready(match next {
                Some((index, (rows, specs))) => {
                    // Page n is requested with the state "page-n" that
                    // page n-1 returned.
                    if index == 0 {
                        assert!(paging_state.as_bytes_slice().is_none());
                    } else {
                        assert_eq!(
                            paging_state.as_bytes_slice(),
                            Some(format!("page-{index}").as_bytes())
                        );
                    }
                    let paging_state_response = if index + 1 < total {
                        PagingStateResponse::HasMorePages {
                            state: PagingState::new_from_raw_bytes(
                                format!("page-{}", index + 1).into_bytes(),
                            ),
                        }
                    } else {
                        PagingStateResponse::NoMorePages
                    };
                    Ok(QueryResult::new(Some(rows), specs, paging_state_response))
                }
                None => panic!("fetcher called after the final page"),
            })
        }
    }

    #[tokio::test]
    async fn iterates_across_pages_in_order() {
        let specs = col_specs(&["a"]);
        let pages = vec![
            ((0..3).map(int_row).collect(), specs.clone()),
            ((3..6).map(int_row).collect(), specs.clone()),
            ((6..8).map(int_row).collect(), specs.clone()),
        ];
        let mut pager = QueryPager::new(scripted_fetcher(pages), PagingState::start(), true)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(row) = pager.next_row().await {
            let row = row.unwrap();
            seen.push(row.columns[0].as_ref().unwrap().as_int().unwrap());
        }
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_result_set_yields_no_rows() {
        let pages = vec![(Vec::new(), col_specs(&["a"]))];
        let mut pager = QueryPager::new(scripted_fetcher(pages), PagingState::start(), true)
            .await
            .unwrap();
        assert!(pager.next_row().await.is_none());
    }

    #[tokio::test]
    async fn metadata_rotation_switches_column_specs_mid_stream() {
        let before = col_specs(&["a", "b"]);
        let after = col_specs(&["a", "b", "c"]);
        let pages = vec![
            (vec![int_row(1)], before.clone()),
            (vec![int_row(2)], after.clone()),
        ];
        let mut pager = QueryPager::new(scripted_fetcher(pages), PagingState::start(), true)
            .await
            .unwrap();

        assert_eq!(pager.col_specs().len(), 2);
        pager.next_row().await.unwrap().unwrap();
        // Crossing the page boundary adopts the new schema.
        pager.next_row().await.unwrap().unwrap();
        assert_eq!(pager.col_specs().len(), 3);
        assert!(pager.next_row().await.is_none());
    }

    #[tokio::test]
    async fn manual_paging_stops_at_page_boundary() {
        let specs = col_specs(&["a"]);
        let pages = vec![
            ((0..3).map(int_row).collect(), specs.clone()),
            ((3..5).map(int_row).collect(), specs.clone()),
        ];
        let mut pager = QueryPager::new(scripted_fetcher(pages), PagingState::start(), false)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(row) = pager.next_row().await {
            let row = row.unwrap();
            seen.push(row.columns[0].as_ref().unwrap().as_int().unwrap());
        }
        // Only the first page was delivered; the paging state points at
        // the second.
        assert_eq!(seen, vec![0, 1, 2]);
        match pager.paging_state_response() {
            PagingStateResponse::HasMorePages { state } => {
                assert_eq!(state.as_bytes_slice(), Some(b"page-1".as_ref()));
            }
            PagingStateResponse::NoMorePages => panic!("expected more pages"),
        }
    }

    #[tokio::test]
    async fn error_on_second_page_surfaces_after_first_page_rows() {
        let mut called = false;
        let fetcher = move |_paging_state: PagingState| {
            let first = !called;
            called = true;
            std::future::ready(if first {
                Ok(QueryResult::new(
                    Some(vec![int_row(1)]),
                    col_specs(&["a"]),
                    PagingStateResponse::HasMorePages {
                        state: PagingState::new_from_raw_bytes(b"next".to_vec()),
                    },
                ))
            } else {
                Err(ExecutionError::EmptyPlan)
            })
        };
        let mut pager = QueryPager::new(fetcher, PagingState::start(), true).await.unwrap();
        assert!(pager.next_row().await.unwrap().is_ok());
        let err = pager.next_row().await.unwrap().unwrap_err();
        assert_matches!(
            err,
            NextRowError::NextPage(NextPageError::Execution(ExecutionError::EmptyPlan))
        );
    }
}
