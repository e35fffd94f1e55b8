//! Simple (unprepared) statements: opaque CQL text plus bound values.

use super::{CqlText, PageSize, StatementConfig, StatementValues};
use typhon_cql::frame::request::PagingState;
use typhon_cql::{Consistency, SerialConsistency};

/// An unprepared statement, executed via QUERY. The driver never parses
/// the text.
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) contents: CqlText,
    pub(crate) config: StatementConfig,
    pub(crate) values: StatementValues,
}

impl Statement {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: Into::<String>::into(contents).into(),
            config: StatementConfig::new(),
            values: StatementValues::default(),
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Binds positional values.
    pub fn with_values(mut self, values: Vec<Option<typhon_cql::value::CqlValue>>) -> Self {
        self.values = StatementValues::Positional(values);
        self
    }

    /// Binds named values; needs protocol v3 or newer.
    pub fn with_named_values(
        mut self,
        values: Vec<(String, Option<typhon_cql::value::CqlValue>)>,
    ) -> Self {
        self.values = StatementValues::Named(values);
        self
    }

    pub fn set_consistency(&mut self, consistency: Consistency) {
        self.config.consistency = Some(consistency);
    }

    pub fn set_serial_consistency(&mut self, serial_consistency: Option<SerialConsistency>) {
        self.config.serial_consistency = serial_consistency;
    }

    pub fn set_page_size(&mut self, page_size: PageSize) {
        self.config.page_size = Some(page_size);
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = Some(is_idempotent);
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent()
    }

    /// Resumes a manually paged result set at the given state.
    pub fn set_paging_state(&mut self, paging_state: PagingState) {
        self.config.paging_state = paging_state;
    }

    /// Disables transparent page fetching on iteration.
    pub fn set_auto_page(&mut self, auto_page: bool) {
        self.config.auto_page = auto_page;
    }

    /// Sets the keyspace this statement runs in, overriding the session
    /// keyspace; needs protocol v5.
    pub fn set_keyspace(&mut self, keyspace: Option<String>) {
        self.config.keyspace = keyspace;
    }

    pub fn set_request_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.config.request_timeout = timeout;
    }

    /// Requests server-side tracing for executions of this statement.
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn config(&self) -> &StatementConfig {
        &self.config
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Self {
        Statement::new(contents)
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Self {
        Statement::new(contents)
    }
}
