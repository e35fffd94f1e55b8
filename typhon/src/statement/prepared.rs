//! Prepared statements and bound statements.

use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;

use super::{serialize_against_specs, CqlText, StatementConfig};
use crate::errors::PartitionKeyError;
use crate::routing::{PartitionKey, Token};
use typhon_cql::frame::response::result::{
    PartitionKeyIndex, Prepared, PreparedMetadata, ResultMetadata,
};
use typhon_cql::serialize::{SerializeError, SerializedValues};
use typhon_cql::value::CqlValue;
use typhon_cql::ProtocolVersion;

/// The result metadata of a prepared statement together with the id the
/// server knows it under. Replaced wholesale when the server rotates the
/// id after a schema change, so readers always see a consistent pair.
#[derive(Debug)]
pub struct ResultMetadataHolder {
    pub id: Option<Bytes>,
    pub metadata: ResultMetadata,
}

/// A statement prepared server-side, referenced by its opaque id.
///
/// Cheap to clone the [`Arc`]; all clones share the mutable result
/// metadata slot, so a rotation observed by one execution is visible to
/// every holder.
#[derive(Debug)]
pub struct PreparedStatement {
    id: Bytes,
    contents: CqlText,
    prepared_metadata: PreparedMetadata,
    result_metadata: ArcSwap<ResultMetadataHolder>,
    /// The keyspace the session was set to when preparing; part of the
    /// cache identity.
    keyspace_at_prepare_time: Option<String>,
    is_lwt: bool,
    pub(crate) config: StatementConfig,
}

impl PreparedStatement {
    pub(crate) fn new(
        contents: CqlText,
        response: Prepared,
        keyspace_at_prepare_time: Option<String>,
        config: StatementConfig,
        is_lwt: bool,
    ) -> Self {
        Self {
            id: response.id,
            contents,
            prepared_metadata: response.prepared_metadata,
            result_metadata: ArcSwap::from_pointee(ResultMetadataHolder {
                id: response.result_metadata_id,
                metadata: response.result_metadata,
            }),
            keyspace_at_prepare_time,
            is_lwt,
            config,
        }
    }

    pub fn get_id(&self) -> &Bytes {
        &self.id
    }

    pub fn get_statement(&self) -> &str {
        &self.contents
    }

    pub(crate) fn contents_arc(&self) -> CqlText {
        self.contents.clone()
    }

    pub fn get_keyspace_name(&self) -> Option<&str> {
        self.keyspace_at_prepare_time.as_deref()
    }

    /// Whether the statement is a lightweight transaction; used by load
    /// balancing to pin LWTs to the primary replica.
    pub fn is_confirmed_lwt(&self) -> bool {
        self.is_lwt
    }

    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.prepared_metadata
    }

    pub fn get_variable_pk_indexes(&self) -> &[PartitionKeyIndex] {
        &self.prepared_metadata.pk_indexes
    }

    /// The current result metadata and its id. A snapshot; a concurrent
    /// rotation replaces the slot atomically.
    pub fn result_metadata(&self) -> Arc<ResultMetadataHolder> {
        self.result_metadata.load_full()
    }

    pub fn result_metadata_id(&self) -> Option<Bytes> {
        self.result_metadata.load().id.clone()
    }

    /// Installs rotated result metadata received from an EXECUTE on
    /// protocol v5. Readers observe either the old or the new pair,
    /// never a mix.
    pub(crate) fn rotate_result_metadata(&self, id: Bytes, metadata: ResultMetadata) {
        self.result_metadata
            .store(Arc::new(ResultMetadataHolder {
                id: Some(id),
                metadata,
            }));
    }

    /// Whether the statement's table has a partition key the driver can
    /// compute, i.e. token-aware routing is possible.
    pub fn is_token_aware(&self) -> bool {
        !self.prepared_metadata.pk_indexes.is_empty()
    }

    /// Serializes values against the prepared variable metadata.
    pub(crate) fn serialize_values(
        &self,
        values: &[Option<CqlValue>],
        version: ProtocolVersion,
    ) -> Result<SerializedValues, SerializeError> {
        serialize_against_specs(values, &self.prepared_metadata.col_specs, version)
    }

    /// Computes the routing key for the given serialized values, absent
    /// when the statement is not token-aware or a pk column is unbound.
    pub(crate) fn compute_routing_key(
        &self,
        serialized_values: &SerializedValues,
    ) -> Result<Option<Bytes>, PartitionKeyError> {
        if !self.is_token_aware() {
            return Ok(None);
        }
        match PartitionKey::new(&self.prepared_metadata, serialized_values) {
            Ok(pk) => Ok(Some(pk.to_bytes()?)),
            // An unbound pk column simply disables routing.
            Err(PartitionKeyError::UnboundColumn { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Computes the token the statement routes to, when token-aware.
    pub fn calculate_token(
        &self,
        serialized_values: &SerializedValues,
    ) -> Result<Option<Token>, PartitionKeyError> {
        if !self.is_token_aware() {
            return Ok(None);
        }
        match PartitionKey::new(&self.prepared_metadata, serialized_values) {
            Ok(pk) => Ok(Some(pk.calculate_token()?)),
            Err(PartitionKeyError::UnboundColumn { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = Some(is_idempotent);
    }

    pub fn set_page_size(&mut self, page_size: super::PageSize) {
        self.config.page_size = Some(page_size);
    }

    /// Requests server-side tracing for executions of this statement.
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn config(&self) -> &StatementConfig {
        &self.config
    }

    /// Pairs the prepared statement with concrete values. Clone the
    /// [`Arc`] to bind the same statement again.
    pub fn bind(self: Arc<Self>, values: Vec<Option<CqlValue>>) -> BoundStatement {
        BoundStatement {
            prepared: self,
            values,
            config_override: None,
        }
    }
}

/// A prepared statement paired with values for one execution.
#[derive(Debug, Clone)]
pub struct BoundStatement {
    pub(crate) prepared: Arc<PreparedStatement>,
    pub(crate) values: Vec<Option<CqlValue>>,
    /// Per-execution option overrides, e.g. a paging state to resume at.
    pub(crate) config_override: Option<StatementConfig>,
}

impl BoundStatement {
    pub fn prepared(&self) -> &Arc<PreparedStatement> {
        &self.prepared
    }

    pub(crate) fn config(&self) -> &StatementConfig {
        self.config_override
            .as_ref()
            .unwrap_or(&self.prepared.config)
    }

    fn config_mut(&mut self) -> &mut StatementConfig {
        self.config_override
            .get_or_insert_with(|| self.prepared.config.clone())
    }

    pub fn set_paging_state(&mut self, paging_state: typhon_cql::frame::request::PagingState) {
        self.config_mut().paging_state = paging_state;
    }

    pub fn set_page_size(&mut self, page_size: super::PageSize) {
        self.config_mut().page_size = Some(page_size);
    }

    pub fn set_auto_page(&mut self, auto_page: bool) {
        self.config_mut().auto_page = auto_page;
    }

    pub fn set_request_timeout(&mut self, timeout: Option<std::time::Duration>) {
        self.config_mut().request_timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use typhon_cql::value::{ColumnSpec, ColumnType, TableSpec};

    fn make_prepared(result_cols: &[&str], metadata_id: Option<&'static [u8]>) -> PreparedStatement {
        let table_spec = TableSpec::new("ks", "t");
        PreparedStatement::new(
            "SELECT * FROM ks.t".into(),
            Prepared {
                id: Bytes::from_static(&[1; 16]),
                result_metadata_id: metadata_id.map(Bytes::from_static),
                prepared_metadata: PreparedMetadata::default(),
                result_metadata: ResultMetadata {
                    col_count: result_cols.len(),
                    col_specs: result_cols
                        .iter()
                        .map(|name| ColumnSpec {
                            table_spec: table_spec.clone(),
                            name: (*name).to_owned(),
                            typ: ColumnType::Text,
                        })
                        .collect(),
                    new_metadata_id: None,
                },
            },
            None,
            StatementConfig::new(),
            false,
        )
    }

    #[test]
    fn result_metadata_rotation_swaps_id_and_columns_together() {
        let prepared = make_prepared(&["a", "b"], Some(&[0x01]));

        let before = prepared.result_metadata();
        assert_eq!(before.id.as_deref(), Some(&[0x01][..]));
        assert_eq!(before.metadata.col_specs.len(), 2);

        prepared.rotate_result_metadata(
            Bytes::from_static(&[0x02]),
            ResultMetadata {
                col_count: 3,
                col_specs: vec![
                    before.metadata.col_specs[0].clone(),
                    before.metadata.col_specs[1].clone(),
                    ColumnSpec {
                        table_spec: TableSpec::new("ks", "t"),
                        name: "c".to_owned(),
                        typ: ColumnType::Text,
                    },
                ],
                new_metadata_id: None,
            },
        );

        // A new snapshot sees the new pair; the old snapshot is intact.
        let after = prepared.result_metadata();
        assert_eq!(after.id.as_deref(), Some(&[0x02][..]));
        assert_eq!(after.metadata.col_specs.len(), 3);
        assert_eq!(before.metadata.col_specs.len(), 2);
    }
}
