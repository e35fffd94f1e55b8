//! Statement types and their per-statement execution options.

pub mod batch;
pub mod prepared;
pub mod unprepared;

pub use batch::{Batch, BatchStatement, BatchType};
pub use prepared::{BoundStatement, PreparedStatement};
pub use unprepared::Statement;

use std::sync::Arc;
use std::time::Duration;

use typhon_cql::frame::request::PagingState;
use typhon_cql::serialize::{SerializeError, SerializedValues};
use typhon_cql::value::{ColumnSpec, CqlValue};
use typhon_cql::{Consistency, ProtocolVersion, SerialConsistency};

/// A validated, positive page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(i32);

impl PageSize {
    /// Creates a new [`PageSize`]; the value must be at least 1.
    pub fn new(size: i32) -> Result<Self, InvalidPageSize> {
        if size < 1 {
            return Err(InvalidPageSize(size));
        }
        Ok(Self(size))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        // The conventional server-side default.
        Self(5000)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Page size must be at least 1, got {0}")]
pub struct InvalidPageSize(i32);

/// Options attached to any statement kind. Absent fields fall back to the
/// session-wide defaults at execution time.
#[derive(Debug, Clone, Default)]
pub struct StatementConfig {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<SerialConsistency>,
    pub page_size: Option<PageSize>,
    /// Client-supplied write timestamp, microseconds since the epoch.
    pub timestamp: Option<i64>,
    /// Whether the statement can be safely retried after a write may have
    /// been applied. `None` means unknown, which is treated as `false`.
    pub is_idempotent: Option<bool>,
    /// Per-request keyspace; needs protocol v5.
    pub keyspace: Option<String>,
    /// Resume point for manual paging.
    pub paging_state: PagingState,
    /// Whether to iterate past the first page automatically.
    pub auto_page: bool,
    pub request_timeout: Option<Duration>,
    pub tracing: bool,
    /// Overrides token-aware routing with an explicit routing key.
    pub routing_key: Option<bytes::Bytes>,
}

impl StatementConfig {
    pub(crate) fn new() -> Self {
        Self {
            auto_page: true,
            ..Default::default()
        }
    }

    pub fn is_idempotent(&self) -> bool {
        self.is_idempotent.unwrap_or(false)
    }
}

/// Values bound to a simple statement: positional or named.
#[derive(Debug, Clone)]
pub enum StatementValues {
    Positional(Vec<Option<CqlValue>>),
    Named(Vec<(String, Option<CqlValue>)>),
}

impl Default for StatementValues {
    fn default() -> Self {
        StatementValues::Positional(Vec::new())
    }
}

impl StatementValues {
    pub fn is_empty(&self) -> bool {
        match self {
            StatementValues::Positional(v) => v.is_empty(),
            StatementValues::Named(v) => v.is_empty(),
        }
    }

    /// Serializes the values, inferring types from the runtime shapes.
    /// Used for simple statements, which carry no server metadata.
    pub(crate) fn serialize_inferred(
        &self,
        version: ProtocolVersion,
    ) -> Result<SerializedValues, SerializeError> {
        let mut serialized = SerializedValues::new();
        match self {
            StatementValues::Positional(values) => {
                for value in values {
                    serialized.add_value_inferred(value.as_ref(), version)?;
                }
            }
            StatementValues::Named(values) => {
                for (name, value) in values {
                    match value {
                        Some(v) => {
                            let typ = typhon_cql::serialize::infer_column_type(v)?;
                            serialized.add_named_value(name, value.as_ref(), &typ, version)?;
                        }
                        None => {
                            // A null still needs a type slot; infer is
                            // impossible, so use a blob descriptor, which
                            // serializes null identically for every type.
                            serialized.add_named_value(
                                name,
                                None,
                                &typhon_cql::value::ColumnType::Blob,
                                version,
                            )?;
                        }
                    }
                }
            }
        }
        Ok(serialized)
    }
}

/// Serializes positional values against the column specs the server sent
/// when preparing. Used for bound statements.
pub(crate) fn serialize_against_specs(
    values: &[Option<CqlValue>],
    specs: &[ColumnSpec],
    version: ProtocolVersion,
) -> Result<SerializedValues, SerializeError> {
    if values.len() != specs.len() {
        return Err(SerializeError::Unencodable(
            "bound value count differs from the prepared variable count",
        ));
    }
    let mut serialized = SerializedValues::new();
    for (value, spec) in values.iter().zip(specs) {
        serialized.add_value(value.as_ref(), &spec.typ, version)?;
    }
    Ok(serialized)
}

/// Shared helper for cheaply cloneable CQL text.
pub(crate) type CqlText = Arc<str>;
