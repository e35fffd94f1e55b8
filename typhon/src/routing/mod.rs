//! Token-aware routing: routing-key composition, token computation and
//! Scylla shard mapping.

pub mod partitioner;
pub mod sharding;

use smallvec::SmallVec;
use typhon_cql::frame::response::result::PreparedMetadata;
use typhon_cql::frame::types::RawValue;
use typhon_cql::serialize::SerializedValues;

use crate::errors::PartitionKeyError;
use partitioner::{Murmur3Partitioner, Partitioner, PartitionerHasher};

/// A token on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token {
    pub value: i64,
}

impl Token {
    pub fn new(value: i64) -> Self {
        Token { value }
    }
}

/// The serialized partition-key columns of one bound statement, in
/// partition-key order.
///
/// Most partition keys have one or two columns, hence the inline vector.
#[derive(Debug)]
pub struct PartitionKey<'ps> {
    columns: SmallVec<[&'ps [u8]; 2]>,
}

impl<'ps> PartitionKey<'ps> {
    /// Picks the partition-key values out of the serialized bind values,
    /// using the pk indexes the server sent when preparing.
    ///
    /// Fails when a partition-key column is unbound or null; such a
    /// statement has no routing key.
    pub fn new(
        prepared_metadata: &PreparedMetadata,
        bound_values: &'ps SerializedValues,
    ) -> Result<Self, PartitionKeyError> {
        // pk_indexes are sorted by value index, so a single pass over the
        // values collects them all; `sequence` then restores pk order.
        let mut columns_in_pk_order: SmallVec<[(&[u8], u16); 2]> =
            SmallVec::with_capacity(prepared_metadata.pk_indexes.len());
        let mut values_iter = bound_values.iter();
        let mut next_value_index = 0u16;

        for pk_index in &prepared_metadata.pk_indexes {
            let value = values_iter
                .by_ref()
                .nth((pk_index.index - next_value_index) as usize)
                .ok_or(PartitionKeyError::UnboundColumn {
                    index: pk_index.index,
                })?;
            next_value_index = pk_index.index + 1;

            match value {
                RawValue::Value(v) => columns_in_pk_order.push((v, pk_index.sequence)),
                RawValue::Null | RawValue::Unset => {
                    return Err(PartitionKeyError::UnboundColumn {
                        index: pk_index.index,
                    })
                }
            }
        }

        columns_in_pk_order.sort_unstable_by_key(|(_, sequence)| *sequence);
        Ok(PartitionKey {
            columns: columns_in_pk_order.into_iter().map(|(v, _)| v).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Feeds the encoded partition key to `writer`: the single column's
    /// raw bytes, or for composite keys each component as a 2-byte
    /// length, the bytes, and a trailing zero byte.
    pub fn write_encoded(
        &self,
        writer: &mut impl FnMut(&[u8]),
    ) -> Result<(), PartitionKeyError> {
        if let [single] = self.columns.as_slice() {
            writer(single);
            return Ok(());
        }
        for column in &self.columns {
            let len: u16 = column
                .len()
                .try_into()
                .map_err(|_| PartitionKeyError::ValueTooLong { size: column.len() })?;
            writer(&len.to_be_bytes());
            writer(column);
            writer(&[0u8]);
        }
        Ok(())
    }

    /// The routing key as owned bytes.
    pub fn to_bytes(&self) -> Result<bytes::Bytes, PartitionKeyError> {
        let mut buf = bytes::BytesMut::new();
        self.write_encoded(&mut |chunk| buf.extend_from_slice(chunk))?;
        Ok(buf.freeze())
    }

    /// The Murmur3 token of this partition key.
    pub fn calculate_token(&self) -> Result<Token, PartitionKeyError> {
        let mut hasher = Murmur3Partitioner.build_hasher();
        self.write_encoded(&mut |chunk| hasher.write(chunk))?;
        Ok(hasher.finish())
    }
}

/// Computes the token for an already-composed routing key.
pub fn hash_routing_key(routing_key: &[u8]) -> Token {
    Murmur3Partitioner.hash_one(routing_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use typhon_cql::frame::response::result::PartitionKeyIndex;
    use typhon_cql::value::{ColumnSpec, ColumnType, CqlValue, TableSpec};
    use typhon_cql::ProtocolVersion;

    fn make_metadata(
        col_types: &[ColumnType],
        pk_index_positions: &[usize],
    ) -> PreparedMetadata {
        let table_spec = TableSpec::new("ks", "t");
        let col_specs: Vec<_> = col_types
            .iter()
            .enumerate()
            .map(|(i, typ)| ColumnSpec {
                table_spec: table_spec.clone(),
                name: format!("col_{i}"),
                typ: typ.clone(),
            })
            .collect();
        let mut pk_indexes: Vec<_> = pk_index_positions
            .iter()
            .enumerate()
            .map(|(sequence, index)| PartitionKeyIndex {
                index: *index as u16,
                sequence: sequence as u16,
            })
            .collect();
        pk_indexes.sort_unstable_by_key(|pki| pki.index);
        PreparedMetadata {
            flags: 0,
            col_count: col_specs.len(),
            pk_indexes,
            col_specs,
        }
    }

    fn serialize_text_values(values: &[&str]) -> SerializedValues {
        let mut serialized = SerializedValues::new();
        for v in values {
            serialized
                .add_value(
                    Some(&CqlValue::Text(v.to_string())),
                    &ColumnType::Text,
                    ProtocolVersion::V4,
                )
                .unwrap();
        }
        serialized
    }

    #[test]
    fn single_column_routing_key_is_raw_value() {
        let metadata = make_metadata(&[ColumnType::Text], &[0]);
        let values = serialize_text_values(&["aValue1"]);
        let pk = PartitionKey::new(&metadata, &values).unwrap();
        assert_eq!(pk.to_bytes().unwrap().as_ref(), b"aValue1");
    }

    #[test]
    fn composite_routing_key_layout() {
        let metadata = make_metadata(&[ColumnType::Text, ColumnType::Text], &[0, 1]);
        let values = serialize_text_values(&["aValue1", "bValue1"]);
        let pk = PartitionKey::new(&metadata, &values).unwrap();
        let expected: &[u8] = &[
            0x00, 0x07, b'a', b'V', b'a', b'l', b'u', b'e', b'1', 0x00, //
            0x00, 0x07, b'b', b'V', b'a', b'l', b'u', b'e', b'1', 0x00,
        ];
        assert_eq!(pk.to_bytes().unwrap().as_ref(), expected);
    }

    #[test]
    fn pk_columns_are_reordered_into_pk_order() {
        // Value order (a, b), but partition key order is (b, a).
        let metadata = make_metadata(&[ColumnType::Text, ColumnType::Text], &[1, 0]);
        let values = serialize_text_values(&["aValue1", "bValue1"]);
        let pk = PartitionKey::new(&metadata, &values).unwrap();
        let bytes = pk.to_bytes().unwrap();
        assert!(bytes.as_ref().starts_with(&[0x00, 0x07, b'b']));
    }

    #[test]
    fn unbound_pk_column_yields_no_routing_key() {
        let metadata = make_metadata(&[ColumnType::Text, ColumnType::Text], &[0, 1]);
        let mut values = SerializedValues::new();
        values
            .add_value(
                Some(&CqlValue::Text("a".to_owned())),
                &ColumnType::Text,
                ProtocolVersion::V4,
            )
            .unwrap();
        values.add_value(None, &ColumnType::Text, ProtocolVersion::V4).unwrap();
        assert_eq!(
            PartitionKey::new(&metadata, &values).unwrap_err(),
            PartitionKeyError::UnboundColumn { index: 1 }
        );
    }
}
