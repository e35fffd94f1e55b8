//! Batches of simple and bound statements.

use super::{BoundStatement, Statement, StatementConfig};

pub use typhon_cql::frame::request::BatchType;

/// One child of a batch.
#[derive(Debug, Clone)]
pub enum BatchStatement {
    Query(Statement),
    Prepared(BoundStatement),
}

impl From<Statement> for BatchStatement {
    fn from(statement: Statement) -> Self {
        BatchStatement::Query(statement)
    }
}

impl From<BoundStatement> for BatchStatement {
    fn from(bound: BoundStatement) -> Self {
        BatchStatement::Prepared(bound)
    }
}

/// A batch of statements executed through a single BATCH request.
/// Ordering within the batch is the server's concern; the driver only
/// preserves the child order on the wire.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub(crate) batch_type: BatchType,
    pub(crate) statements: Vec<BatchStatement>,
    pub(crate) config: StatementConfig,
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            statements: Vec::new(),
            config: StatementConfig::new(),
        }
    }

    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn statements(&self) -> &[BatchStatement] {
        &self.statements
    }

    pub fn batch_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn set_consistency(&mut self, consistency: typhon_cql::Consistency) {
        self.config.consistency = Some(consistency);
    }

    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = Some(is_idempotent);
    }

    /// A batch is idempotent only if explicitly marked so or if every
    /// child is.
    pub fn is_idempotent(&self) -> bool {
        self.config.is_idempotent.unwrap_or_else(|| {
            !self.statements.is_empty()
                && self.statements.iter().all(|s| match s {
                    BatchStatement::Query(q) => q.get_is_idempotent(),
                    BatchStatement::Prepared(b) => b.config().is_idempotent(),
                })
        })
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn config(&self) -> &StatementConfig {
        &self.config
    }
}
