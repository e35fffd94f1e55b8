//! Responses as seen by the driver's callers.

use bytes::Bytes;
use uuid::Uuid;

use crate::errors::RequestAttemptError;
use typhon_cql::frame::request::query::PagingStateResponse;
use typhon_cql::frame::response::error::Error as ErrorResponse;
use typhon_cql::frame::response::result::{CqlResult, Row, Rows};
use typhon_cql::frame::response::Response;
use typhon_cql::value::ColumnSpec;

pub use typhon_cql::frame::request::query::PagingState;

/// A parsed response frame together with its header extensions.
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

/// A non-error response, with errors already converted.
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

pub(crate) enum NonErrorResponse {
    Result(CqlResult),
    Other(&'static str),
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let response = match self.response {
            Response::Error(ErrorResponse { error, reason }) => {
                return Err(RequestAttemptError::Db(error, reason))
            }
            Response::Result(result) => NonErrorResponse::Result(result),
            other => NonErrorResponse::Other(other.to_response_kind()),
        };
        Ok(NonErrorQueryResponse {
            response,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn into_query_result(self) -> Result<QueryResult, RequestAttemptError> {
        match self.response {
            NonErrorResponse::Result(CqlResult::Rows(rows)) => {
                let Rows {
                    metadata,
                    paging_state_response,
                    rows,
                } = rows;
                Ok(QueryResult {
                    rows: Some(rows),
                    col_specs: metadata.col_specs,
                    new_metadata_id: metadata.new_metadata_id,
                    paging_state_response,
                    tracing_id: self.tracing_id,
                    warnings: self.warnings,
                })
            }
            NonErrorResponse::Result(_) => Ok(QueryResult {
                rows: None,
                col_specs: Vec::new(),
                new_metadata_id: None,
                paging_state_response: PagingStateResponse::NoMorePages,
                tracing_id: self.tracing_id,
                warnings: self.warnings,
            }),
            NonErrorResponse::Other(kind) => {
                Err(RequestAttemptError::UnexpectedResponse(kind))
            }
        }
    }
}

/// The materialized result of one request: rows (when the response was
/// of Rows kind), result metadata and the paging state to resume at.
#[derive(Debug)]
pub struct QueryResult {
    rows: Option<Vec<Row>>,
    col_specs: Vec<ColumnSpec>,
    new_metadata_id: Option<Bytes>,
    paging_state_response: PagingStateResponse,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
}

impl QueryResult {
    pub(crate) fn new(
        rows: Option<Vec<Row>>,
        col_specs: Vec<ColumnSpec>,
        paging_state_response: PagingStateResponse,
    ) -> Self {
        Self {
            rows,
            col_specs,
            new_metadata_id: None,
            paging_state_response,
            tracing_id: None,
            warnings: Vec::new(),
        }
    }

    /// Whether the response was of Rows kind (possibly with zero rows).
    pub fn is_rows(&self) -> bool {
        self.rows.is_some()
    }

    /// The rows; empty for non-Rows results.
    pub fn rows(&self) -> &[Row] {
        self.rows.as_deref().unwrap_or(&[])
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.unwrap_or_default()
    }

    pub fn rows_num(&self) -> usize {
        self.rows.as_ref().map_or(0, Vec::len)
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows().first()
    }

    /// The column specs of the result set; empty for non-Rows results.
    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    pub(crate) fn new_metadata_id(&self) -> Option<&Bytes> {
        self.new_metadata_id.as_ref()
    }

    /// Where to resume this result set, for manual paging.
    pub fn paging_state_response(&self) -> &PagingStateResponse {
        &self.paging_state_response
    }

    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }
}
