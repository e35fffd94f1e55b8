//! The RESULT response: Void, Rows, SetKeyspace, Prepared, SchemaChange.

use crate::deserialize::deserialize_value;
use crate::frame::frame_errors::ResponseParseError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::query::PagingStateResponse;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::value::{ColumnSpec, ColumnType, CqlValue, TableSpec};
use bytes::Bytes;

// Rows metadata flags
const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;
const FLAG_METADATA_CHANGED: i32 = 0x0008;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

/// Column metadata of a result set.
#[derive(Debug, Default, Clone)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub col_specs: Vec<ColumnSpec>,
    /// New id of the result metadata, sent on v5 with the
    /// metadata-changed flag when a schema change rotated it.
    pub new_metadata_id: Option<Bytes>,
}

/// Maps a bind-marker position to its place in the partition key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PartitionKeyIndex {
    /// Index among the serialized bind values.
    pub index: u16,
    /// Position within the partition key.
    pub sequence: u16,
}

/// Metadata of a prepared statement's bind markers.
#[derive(Debug, Clone, Default)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// Sorted by `index`; reorder by `sequence` to obtain partition-key
    /// order.
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub paging_state_response: PagingStateResponse,
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    /// Present on v5; rotates when the result schema changes.
    pub result_metadata_id: Option<Bytes>,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug)]
pub enum CqlResult {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> Result<TableSpec, ResponseParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec::new(ks_name, table_name))
}

/// Parses a `org.apache.cassandra.db.marshal.*` class name as sent for
/// custom types. Vectors and durations arrive this way on servers that
/// predate dedicated type ids.
fn parse_custom_type(mut name: &str) -> Result<ColumnType, ResponseParseError> {
    name = name.trim();

    fn split_args(name: &str) -> Result<(&str, Vec<&str>), ResponseParseError> {
        let Some(open) = name.find('(') else {
            return Ok((name, Vec::new()));
        };
        if !name.ends_with(')') {
            return Err(ResponseParseError::MalformedCustomType(name.to_owned()));
        }
        let class = &name[..open];
        let inner = &name[open + 1..name.len() - 1];

        // Split on commas at depth zero.
        let mut args = Vec::new();
        let mut depth = 0usize;
        let mut start = 0usize;
        for (i, c) in inner.char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| ResponseParseError::MalformedCustomType(name.to_owned()))?
                }
                ',' if depth == 0 => {
                    args.push(inner[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            }
        }
        if !inner[start..].trim().is_empty() {
            args.push(inner[start..].trim());
        }
        Ok((class, args))
    }

    let (class, args) = split_args(name)?;
    let short = class.rsplit('.').next().unwrap_or(class);

    let simple = |typ: ColumnType| -> Result<ColumnType, ResponseParseError> {
        if args.is_empty() {
            Ok(typ)
        } else {
            Err(ResponseParseError::MalformedCustomType(name.to_owned()))
        }
    };

    match short {
        "AsciiType" => simple(ColumnType::Ascii),
        "BooleanType" => simple(ColumnType::Boolean),
        "BytesType" => simple(ColumnType::Blob),
        "ByteType" => simple(ColumnType::TinyInt),
        "CounterColumnType" => simple(ColumnType::Counter),
        "DecimalType" => simple(ColumnType::Decimal),
        "DoubleType" => simple(ColumnType::Double),
        "DurationType" => simple(ColumnType::Duration),
        "FloatType" => simple(ColumnType::Float),
        "InetAddressType" => simple(ColumnType::Inet),
        "Int32Type" => simple(ColumnType::Int),
        "IntegerType" => simple(ColumnType::Varint),
        "LongType" => simple(ColumnType::BigInt),
        "ShortType" => simple(ColumnType::SmallInt),
        "SimpleDateType" => simple(ColumnType::Date),
        "TimestampType" => simple(ColumnType::Timestamp),
        "TimeType" => simple(ColumnType::Time),
        "TimeUUIDType" => simple(ColumnType::Timeuuid),
        "UTF8Type" => simple(ColumnType::Text),
        "UUIDType" => simple(ColumnType::Uuid),
        "ListType" => match args.as_slice() {
            [elem] => Ok(ColumnType::List(Box::new(parse_custom_type(elem)?))),
            _ => Err(ResponseParseError::MalformedCustomType(name.to_owned())),
        },
        "SetType" => match args.as_slice() {
            [elem] => Ok(ColumnType::Set(Box::new(parse_custom_type(elem)?))),
            _ => Err(ResponseParseError::MalformedCustomType(name.to_owned())),
        },
        "MapType" => match args.as_slice() {
            [key, value] => Ok(ColumnType::Map(
                Box::new(parse_custom_type(key)?),
                Box::new(parse_custom_type(value)?),
            )),
            _ => Err(ResponseParseError::MalformedCustomType(name.to_owned())),
        },
        "VectorType" => match args.as_slice() {
            [elem, dimension] => {
                let dimension: u16 = dimension.parse().map_err(|_| {
                    ResponseParseError::MalformedCustomType(name.to_owned())
                })?;
                Ok(ColumnType::Vector {
                    element: Box::new(parse_custom_type(elem)?),
                    dimension,
                })
            }
            _ => Err(ResponseParseError::MalformedCustomType(name.to_owned())),
        },
        _ => Ok(ColumnType::Custom(name.to_owned())),
    }
}

fn deser_type(buf: &mut &[u8]) -> Result<ColumnType, ResponseParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => parse_custom_type(types::read_string(buf)?)?,
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace = types::read_string(buf)?.to_owned();
            let type_name = types::read_string(buf)?.to_owned();
            let fields_count: usize = types::read_short(buf)?.into();

            let mut field_types = Vec::with_capacity(fields_count);
            for _ in 0..fields_count {
                let field_name = types::read_string(buf)?.to_owned();
                let field_type = deser_type(buf)?;
                field_types.push((field_name, field_type));
            }

            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            }
        }
        0x0031 => {
            let arity: usize = types::read_short(buf)?.into();
            let mut elem_types = Vec::with_capacity(arity);
            for _ in 0..arity {
                elem_types.push(deser_type(buf)?);
            }
            Tuple(elem_types)
        }
        id => return Err(ResponseParseError::TypeNotImplemented(id)),
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> Result<Vec<ColumnSpec>, ResponseParseError> {
    let mut col_specs = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let table_spec = match global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)?,
        };
        let name = types::read_string(buf)?.to_owned();
        let typ = deser_type(buf)?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<(ResultMetadata, PagingStateResponse), ResponseParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;
    let metadata_changed =
        version.supports_result_metadata_id() && flags & FLAG_METADATA_CHANGED != 0;

    let col_count = types::read_int_length(buf)?;

    let paging_state = if has_more_pages {
        PagingStateResponse::new_from_raw_bytes(Some(types::read_bytes(buf)?))
    } else {
        PagingStateResponse::NoMorePages
    };

    let new_metadata_id = if metadata_changed {
        Some(Bytes::copy_from_slice(types::read_short_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok((
            ResultMetadata {
                col_count,
                col_specs: Vec::new(),
                new_metadata_id,
            },
            paging_state,
        ));
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok((
        ResultMetadata {
            col_count,
            col_specs,
            new_metadata_id,
        },
        paging_state,
    ))
}

fn deser_prepared_metadata(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<PreparedMetadata, ResponseParseError> {
    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count = types::read_int_length(buf)?;

    let mut pk_indexes = Vec::new();
    if version.supports_pk_indexes() {
        let pk_count = types::read_int_length(buf)?;
        pk_indexes.reserve(pk_count);
        for sequence in 0..pk_count {
            pk_indexes.push(PartitionKeyIndex {
                index: types::read_short(buf)?,
                sequence: sequence as u16,
            });
        }
        pk_indexes.sort_unstable_by_key(|pki| pki.index);
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_rows(
    version: ProtocolVersion,
    buf: &mut &[u8],
    cached_metadata: Option<&[ColumnSpec]>,
) -> Result<Rows, ResponseParseError> {
    let (metadata, paging_state_response) = deser_result_metadata(version, buf)?;

    // An EXECUTE sent with the skip-metadata flag comes back without
    // column specs; decode against the cached ones.
    let col_specs: &[ColumnSpec] = if metadata.col_specs.is_empty() && metadata.col_count != 0 {
        cached_metadata.unwrap_or(&[])
    } else {
        &metadata.col_specs
    };

    if col_specs.len() != metadata.col_count {
        return Err(ResponseParseError::ColumnCountMismatch {
            on_wire: metadata.col_count,
            known: col_specs.len(),
        });
    }

    let rows_count = types::read_int_length(buf)?;

    let mut rows = Vec::with_capacity(rows_count.min(65_536));
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for spec in col_specs {
            let cell = types::read_bytes_opt(buf)?;
            columns.push(match cell {
                Some(body) => Some(deserialize_value(&spec.typ, version, body)?),
                None => None,
            });
        }
        rows.push(Row { columns });
    }

    Ok(Rows {
        metadata,
        paging_state_response,
        rows,
    })
}

fn deser_prepared(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<Prepared, ResponseParseError> {
    let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
    let result_metadata_id = if version.supports_result_metadata_id() {
        Some(Bytes::copy_from_slice(types::read_short_bytes(buf)?))
    } else {
        None
    };
    let prepared_metadata = deser_prepared_metadata(version, buf)?;
    let (result_metadata, paging_state) = deser_result_metadata(version, buf)?;
    debug_assert!(paging_state.finished());

    Ok(Prepared {
        id,
        result_metadata_id,
        prepared_metadata,
        result_metadata,
    })
}

pub fn deserialize(
    version: ProtocolVersion,
    buf: &mut &[u8],
    cached_metadata: Option<&[ColumnSpec]>,
) -> Result<CqlResult, ResponseParseError> {
    Ok(match types::read_int(buf)? {
        0x0001 => CqlResult::Void,
        0x0002 => CqlResult::Rows(deser_rows(version, buf, cached_metadata)?),
        0x0003 => CqlResult::SetKeyspace(SetKeyspace {
            keyspace_name: types::read_string(buf)?.to_owned(),
        }),
        0x0004 => CqlResult::Prepared(deser_prepared(version, buf)?),
        0x0005 => CqlResult::SchemaChange(SchemaChange {
            event: SchemaChangeEvent::deserialize(buf)?,
        }),
        kind => return Err(ResponseParseError::UnknownResultKind(kind)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rows_metadata(
        buf: &mut Vec<u8>,
        cols: &[(&str, u16)],
        paging_state: Option<&[u8]>,
    ) {
        let mut flags = FLAG_GLOBAL_TABLES_SPEC;
        if paging_state.is_some() {
            flags |= FLAG_HAS_MORE_PAGES;
        }
        types::write_int(flags, buf);
        types::write_int(cols.len() as i32, buf);
        if let Some(state) = paging_state {
            types::write_bytes(state, buf).unwrap();
        }
        types::write_string("ks", buf).unwrap();
        types::write_string("t", buf).unwrap();
        for (name, type_id) in cols {
            types::write_string(name, buf).unwrap();
            types::write_short(*type_id, buf);
        }
    }

    #[test]
    fn rows_round_trip_with_paging_state() {
        let mut body = Vec::new();
        types::write_int(0x0002, &mut body); // kind: Rows
        write_rows_metadata(&mut body, &[("a", 0x0009), ("b", 0x000D)], Some(b"cursor"));
        types::write_int(2, &mut body); // rows count
        for i in 0..2i32 {
            types::write_bytes(&i.to_be_bytes(), &mut body).unwrap();
            types::write_bytes(b"x", &mut body).unwrap();
        }

        let mut slice = &body[..];
        let result = deserialize(ProtocolVersion::V4, &mut slice, None).unwrap();
        assert!(slice.is_empty());

        let rows = match result {
            CqlResult::Rows(rows) => rows,
            other => panic!("expected Rows, got {other:?}"),
        };
        assert_eq!(rows.rows.len(), 2);
        assert_eq!(rows.metadata.col_count, 2);
        assert_eq!(rows.metadata.col_specs[1].name, "b");
        assert_eq!(
            rows.rows[1].columns[0],
            Some(CqlValue::Int(1))
        );
        assert!(!rows.paging_state_response.finished());
    }

    #[test]
    fn null_cells_decode_to_none() {
        let mut body = Vec::new();
        types::write_int(0x0002, &mut body);
        write_rows_metadata(&mut body, &[("a", 0x000D)], None);
        types::write_int(1, &mut body);
        types::write_int(-1, &mut body); // null cell

        let result = deserialize(ProtocolVersion::V4, &mut &body[..], None).unwrap();
        let rows = match result {
            CqlResult::Rows(rows) => rows,
            other => panic!("expected Rows, got {other:?}"),
        };
        assert_eq!(rows.rows[0].columns[0], None);
    }

    #[test]
    fn prepared_v4_has_no_metadata_id() {
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body); // kind: Prepared
        types::write_short_bytes(&[0xab; 16], &mut body).unwrap();
        // prepared metadata: global spec, one column, one pk index
        types::write_int(FLAG_GLOBAL_TABLES_SPEC, &mut body);
        types::write_int(1, &mut body);
        types::write_int(1, &mut body);
        types::write_short(0, &mut body);
        types::write_string("ks", &mut body).unwrap();
        types::write_string("t", &mut body).unwrap();
        types::write_string("pk", &mut body).unwrap();
        types::write_short(0x000D, &mut body);
        // result metadata: no columns
        types::write_int(0, &mut body);
        types::write_int(0, &mut body);

        let result = deserialize(ProtocolVersion::V4, &mut &body[..], None).unwrap();
        let prepared = match result {
            CqlResult::Prepared(p) => p,
            other => panic!("expected Prepared, got {other:?}"),
        };
        assert_eq!(prepared.id.as_ref(), &[0xab; 16]);
        assert!(prepared.result_metadata_id.is_none());
        assert_eq!(
            prepared.prepared_metadata.pk_indexes,
            [PartitionKeyIndex {
                index: 0,
                sequence: 0
            }]
        );
    }

    #[test]
    fn custom_type_parser_handles_vector() {
        let parsed = parse_custom_type(
            "org.apache.cassandra.db.marshal.VectorType(org.apache.cassandra.db.marshal.FloatType, 3)",
        )
        .unwrap();
        assert_eq!(
            parsed,
            ColumnType::Vector {
                element: Box::new(ColumnType::Float),
                dimension: 3
            }
        );

        let nested = parse_custom_type(
            "org.apache.cassandra.db.marshal.MapType(org.apache.cassandra.db.marshal.UTF8Type, org.apache.cassandra.db.marshal.ListType(org.apache.cassandra.db.marshal.Int32Type))",
        )
        .unwrap();
        assert_eq!(
            nested,
            ColumnType::Map(
                Box::new(ColumnType::Text),
                Box::new(ColumnType::List(Box::new(ColumnType::Int)))
            )
        );

        // Unknown classes stay opaque.
        let opaque = parse_custom_type("com.example.MyType").unwrap();
        assert_eq!(opaque, ColumnType::Custom("com.example.MyType".to_owned()));
    }
}
