//! The schema-metadata collaborator.
//!
//! Schema discovery itself is out of scope for the driver core; this
//! interface is how the core asks an external component about table
//! layouts. Its single use is deriving partition-key indexes for
//! prepared statements on protocol versions that do not send them
//! (v3 and older), by matching bind-marker names against the table's
//! partition-key columns.

use typhon_cql::frame::response::result::{PartitionKeyIndex, PreparedMetadata};

/// The parts of a table's schema the driver core consumes.
#[derive(Debug, Clone)]
pub struct TableMetadata {
    /// Partition-key column names, in partition-key order.
    pub partition_key_columns: Vec<String>,
}

/// Supplies table schemas on demand.
pub trait SchemaMetadataProvider: Send + Sync + std::fmt::Debug {
    /// The table's metadata, or `None` when unknown. Unknown tables
    /// merely disable token-aware routing for their statements.
    fn get_table(&self, keyspace: &str, table: &str) -> Option<TableMetadata>;
}

/// Fills in missing pk indexes by name-matching the bind markers against
/// the table's partition-key columns. All columns must match, otherwise
/// the routing information would be incomplete and is left absent.
pub(crate) fn derive_pk_indexes(
    prepared_metadata: &mut PreparedMetadata,
    provider: &dyn SchemaMetadataProvider,
) {
    if !prepared_metadata.pk_indexes.is_empty() || prepared_metadata.col_specs.is_empty() {
        return;
    }

    let table_spec = &prepared_metadata.col_specs[0].table_spec;
    let Some(table) = provider.get_table(&table_spec.ks_name, &table_spec.table_name) else {
        return;
    };

    let mut pk_indexes = Vec::with_capacity(table.partition_key_columns.len());
    for (sequence, pk_column) in table.partition_key_columns.iter().enumerate() {
        let index = prepared_metadata
            .col_specs
            .iter()
            .position(|spec| &spec.name == pk_column);
        match index {
            Some(index) => pk_indexes.push(PartitionKeyIndex {
                index: index as u16,
                sequence: sequence as u16,
            }),
            None => return,
        }
    }
    pk_indexes.sort_unstable_by_key(|pki| pki.index);
    prepared_metadata.pk_indexes = pk_indexes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use typhon_cql::value::{ColumnSpec, ColumnType, TableSpec};

    #[derive(Debug)]
    struct FixedSchema(Vec<String>);

    impl SchemaMetadataProvider for FixedSchema {
        fn get_table(&self, _keyspace: &str, _table: &str) -> Option<TableMetadata> {
            Some(TableMetadata {
                partition_key_columns: self.0.clone(),
            })
        }
    }

    fn metadata_with_columns(names: &[&str]) -> PreparedMetadata {
        let table_spec = TableSpec::new("ks", "t");
        PreparedMetadata {
            flags: 0,
            col_count: names.len(),
            pk_indexes: Vec::new(),
            col_specs: names
                .iter()
                .map(|name| ColumnSpec {
                    table_spec: table_spec.clone(),
                    name: (*name).to_owned(),
                    typ: ColumnType::Text,
                })
                .collect(),
        }
    }

    #[test]
    fn derives_indexes_by_column_name() {
        let mut metadata = metadata_with_columns(&["v", "b", "a"]);
        let schema = FixedSchema(vec!["a".to_owned(), "b".to_owned()]);
        derive_pk_indexes(&mut metadata, &schema);

        // Sorted by value index; sequence restores pk order (a, b).
        assert_eq!(
            metadata.pk_indexes,
            [
                PartitionKeyIndex {
                    index: 1,
                    sequence: 1
                },
                PartitionKeyIndex {
                    index: 2,
                    sequence: 0
                },
            ]
        );
    }

    #[test]
    fn unmatched_columns_leave_routing_disabled() {
        let mut metadata = metadata_with_columns(&["v"]);
        let schema = FixedSchema(vec!["a".to_owned()]);
        derive_pk_indexes(&mut metadata, &schema);
        assert!(metadata.pk_indexes.is_empty());
    }

    #[test]
    fn server_sent_indexes_are_preserved() {
        let mut metadata = metadata_with_columns(&["a"]);
        metadata.pk_indexes.push(PartitionKeyIndex {
            index: 0,
            sequence: 0,
        });
        let schema = FixedSchema(vec!["a".to_owned()]);
        derive_pk_indexes(&mut metadata, &schema);
        assert_eq!(metadata.pk_indexes.len(), 1);
    }
}
