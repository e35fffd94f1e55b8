//! Descriptor-driven deserialization of cell bodies into [`CqlValue`]s.

use crate::frame::protocol::ProtocolVersion;
use crate::frame::types;
use crate::value::{
    ColumnType, Counter, CqlDate, CqlDuration, CqlTime, CqlTimestamp, CqlTimeuuid, CqlValue,
    CqlVarint,
};
use bigdecimal::BigDecimal;
use byteorder::{BigEndian, ReadBytesExt};
use num_bigint::BigInt;
use std::net::IpAddr;
use thiserror::Error;

/// An error raised when a cell body cannot be interpreted as its declared
/// type. Deterministic; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeserializeError {
    #[error("Expected {expected} bytes for {typ}, got {got}")]
    BadLength {
        typ: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Cell body ended prematurely")]
    UnexpectedEof,
    #[error("ascii cell contains non-ASCII bytes")]
    NotAscii,
    #[error("Cell is not valid UTF-8")]
    BadUtf8,
    #[error("time value out of range: {0} ns")]
    TimeOutOfRange(i64),
    #[error("Null element in a {0} cell where null is not allowed")]
    UnexpectedNull(&'static str),
    #[error("Custom type {0} is not supported")]
    CustomTypeUnsupported(String),
    #[error("Trailing bytes after decoding a {0} cell")]
    TrailingBytes(&'static str),
    #[error("Malformed cell: {0}")]
    BadData(String),
}

impl From<std::io::Error> for DeserializeError {
    fn from(_: std::io::Error) -> Self {
        DeserializeError::UnexpectedEof
    }
}

fn check_len(
    typ: &'static str,
    buf: &[u8],
    expected: usize,
) -> Result<(), DeserializeError> {
    if buf.len() != expected {
        return Err(DeserializeError::BadLength {
            typ,
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Deserializes a full cell body. The entire slice must be consumed;
/// leftover bytes are an error.
pub fn deserialize_value(
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &[u8],
) -> Result<CqlValue, DeserializeError> {
    // A zero-length body is the special "empty" value for most scalar
    // types. Strings and blobs have a natural zero-length form instead,
    // and collections always parse structurally.
    if buf.is_empty()
        && typ.supports_special_empty_value()
        && !matches!(
            typ,
            ColumnType::Ascii | ColumnType::Text | ColumnType::Blob
        )
    {
        return Ok(CqlValue::Empty);
    }

    let mut buf = buf;
    let value = deserialize_body(typ, version, &mut buf)?;
    if !buf.is_empty() {
        return Err(DeserializeError::TrailingBytes(static_name(typ)));
    }
    Ok(value)
}

fn static_name(typ: &ColumnType) -> &'static str {
    match typ {
        ColumnType::Ascii => "ascii",
        ColumnType::BigInt => "bigint",
        ColumnType::Blob => "blob",
        ColumnType::Boolean => "boolean",
        ColumnType::Counter => "counter",
        ColumnType::Date => "date",
        ColumnType::Decimal => "decimal",
        ColumnType::Double => "double",
        ColumnType::Duration => "duration",
        ColumnType::Float => "float",
        ColumnType::Inet => "inet",
        ColumnType::Int => "int",
        ColumnType::SmallInt => "smallint",
        ColumnType::Text => "text",
        ColumnType::Time => "time",
        ColumnType::Timestamp => "timestamp",
        ColumnType::Timeuuid => "timeuuid",
        ColumnType::TinyInt => "tinyint",
        ColumnType::Uuid => "uuid",
        ColumnType::Varint => "varint",
        ColumnType::List(_) => "list",
        ColumnType::Map(_, _) => "map",
        ColumnType::Set(_) => "set",
        ColumnType::Tuple(_) => "tuple",
        ColumnType::UserDefinedType { .. } => "udt",
        ColumnType::Vector { .. } => "vector",
        ColumnType::Custom(_) => "custom",
    }
}

fn deserialize_body(
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<CqlValue, DeserializeError> {
    Ok(match typ {
        ColumnType::Ascii => {
            if !buf.is_ascii() {
                return Err(DeserializeError::NotAscii);
            }
            let s = std::str::from_utf8(buf).map_err(|_| DeserializeError::BadUtf8)?;
            let v = CqlValue::Ascii(s.to_owned());
            *buf = &[];
            v
        }
        ColumnType::Text => {
            let s = std::str::from_utf8(buf).map_err(|_| DeserializeError::BadUtf8)?;
            let v = CqlValue::Text(s.to_owned());
            *buf = &[];
            v
        }
        ColumnType::Blob => {
            let v = CqlValue::Blob(buf.to_vec());
            *buf = &[];
            v
        }
        ColumnType::Boolean => {
            check_len("boolean", buf, 1)?;
            CqlValue::Boolean(buf.read_u8()? != 0x00)
        }
        ColumnType::TinyInt => {
            check_len("tinyint", buf, 1)?;
            CqlValue::TinyInt(buf.read_i8()?)
        }
        ColumnType::SmallInt => {
            check_len("smallint", buf, 2)?;
            CqlValue::SmallInt(buf.read_i16::<BigEndian>()?)
        }
        ColumnType::Int => {
            check_len("int", buf, 4)?;
            CqlValue::Int(buf.read_i32::<BigEndian>()?)
        }
        ColumnType::BigInt => {
            check_len("bigint", buf, 8)?;
            CqlValue::BigInt(buf.read_i64::<BigEndian>()?)
        }
        ColumnType::Counter => {
            check_len("counter", buf, 8)?;
            CqlValue::Counter(Counter(buf.read_i64::<BigEndian>()?))
        }
        ColumnType::Float => {
            check_len("float", buf, 4)?;
            CqlValue::Float(buf.read_f32::<BigEndian>()?)
        }
        ColumnType::Double => {
            check_len("double", buf, 8)?;
            CqlValue::Double(buf.read_f64::<BigEndian>()?)
        }
        ColumnType::Timestamp => {
            check_len("timestamp", buf, 8)?;
            CqlValue::Timestamp(CqlTimestamp(buf.read_i64::<BigEndian>()?))
        }
        ColumnType::Date => {
            check_len("date", buf, 4)?;
            CqlValue::Date(CqlDate(buf.read_u32::<BigEndian>()?))
        }
        ColumnType::Time => {
            check_len("time", buf, 8)?;
            let nanos = buf.read_i64::<BigEndian>()?;
            if !(0..=CqlTime::MAX_NANOS).contains(&nanos) {
                return Err(DeserializeError::TimeOutOfRange(nanos));
            }
            CqlValue::Time(CqlTime(nanos))
        }
        ColumnType::Uuid => {
            check_len("uuid", buf, 16)?;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(buf);
            *buf = &[];
            CqlValue::Uuid(uuid::Uuid::from_bytes(raw))
        }
        ColumnType::Timeuuid => {
            check_len("timeuuid", buf, 16)?;
            let mut raw = [0u8; 16];
            raw.copy_from_slice(buf);
            *buf = &[];
            CqlValue::Timeuuid(CqlTimeuuid(uuid::Uuid::from_bytes(raw)))
        }
        ColumnType::Inet => {
            let v = match buf.len() {
                4 => IpAddr::from(<[u8; 4]>::try_from(&buf[..]).unwrap()),
                16 => IpAddr::from(<[u8; 16]>::try_from(&buf[..]).unwrap()),
                other => {
                    return Err(DeserializeError::BadLength {
                        typ: "inet",
                        expected: 4,
                        got: other,
                    })
                }
            };
            *buf = &[];
            CqlValue::Inet(v)
        }
        ColumnType::Varint => {
            let v = CqlValue::Varint(CqlVarint::from_signed_bytes_be(buf.to_vec()));
            *buf = &[];
            v
        }
        ColumnType::Decimal => {
            let scale = types::read_int(buf)? as i64;
            let unscaled = BigInt::from_signed_bytes_be(buf);
            *buf = &[];
            CqlValue::Decimal(BigDecimal::from((unscaled, scale)))
        }
        ColumnType::Duration => {
            let months = types::vint_decode(buf)?;
            let days = types::vint_decode(buf)?;
            let nanoseconds = types::vint_decode(buf)?;
            let (months, days) = (
                i32::try_from(months)
                    .map_err(|_| DeserializeError::BadData("duration months overflow".into()))?,
                i32::try_from(days)
                    .map_err(|_| DeserializeError::BadData("duration days overflow".into()))?,
            );
            CqlValue::Duration(CqlDuration {
                months,
                days,
                nanoseconds,
            })
        }
        ColumnType::List(elem) => CqlValue::List(deserialize_sequence(elem, version, buf)?),
        ColumnType::Set(elem) => CqlValue::Set(deserialize_sequence(elem, version, buf)?),
        ColumnType::Map(key_typ, val_typ) => {
            let count = read_collection_length(version, buf)?;
            let mut entries = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                let key = match read_element(version, buf)? {
                    Some(body) => deserialize_value(key_typ, version, body)?,
                    None => return Err(DeserializeError::UnexpectedNull("map key")),
                };
                let value = match read_element(version, buf)? {
                    Some(body) => deserialize_value(val_typ, version, body)?,
                    None => CqlValue::Null,
                };
                entries.push((key, value));
            }
            CqlValue::Map(entries)
        }
        ColumnType::Tuple(elem_types) => {
            let mut elems = Vec::with_capacity(elem_types.len());
            for elem_typ in elem_types {
                // Missing trailing elements decode as nulls.
                if buf.is_empty() {
                    elems.push(None);
                    continue;
                }
                let cell = types::read_bytes_opt(buf)
                    .map_err(|_| DeserializeError::UnexpectedEof)?;
                elems.push(match cell {
                    Some(body) => Some(deserialize_value(elem_typ, version, body)?),
                    None => None,
                });
            }
            CqlValue::Tuple(elems)
        }
        ColumnType::UserDefinedType {
            keyspace,
            type_name,
            field_types,
        } => {
            let mut fields = Vec::with_capacity(field_types.len());
            for (field_name, field_typ) in field_types {
                // Missing trailing fields are nulls: the server may know a
                // newer version of the type than this metadata.
                if buf.is_empty() {
                    fields.push((field_name.clone(), None));
                    continue;
                }
                let cell = types::read_bytes_opt(buf)
                    .map_err(|_| DeserializeError::UnexpectedEof)?;
                fields.push((
                    field_name.clone(),
                    match cell {
                        Some(body) => Some(deserialize_value(field_typ, version, body)?),
                        None => None,
                    },
                ));
            }
            CqlValue::UserDefinedType {
                keyspace: keyspace.clone(),
                type_name: type_name.clone(),
                fields,
            }
        }
        ColumnType::Vector { element, dimension } => {
            let mut items = Vec::with_capacity(*dimension as usize);
            if let Some(elem_size) = element.fixed_size() {
                for _ in 0..*dimension {
                    let body = types::read_raw_bytes(elem_size, buf)
                        .map_err(|_| DeserializeError::UnexpectedEof)?;
                    items.push(deserialize_value(element, version, body)?);
                }
            } else {
                for _ in 0..*dimension {
                    let len = types::unsigned_vint_decode(buf)? as usize;
                    let body = types::read_raw_bytes(len, buf)
                        .map_err(|_| DeserializeError::UnexpectedEof)?;
                    items.push(deserialize_value(element, version, body)?);
                }
            }
            CqlValue::Vector(items)
        }
        ColumnType::Custom(name) => {
            return Err(DeserializeError::CustomTypeUnsupported(name.clone()))
        }
    })
}

fn deserialize_sequence(
    elem: &ColumnType,
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<Vec<CqlValue>, DeserializeError> {
    let count = read_collection_length(version, buf)?;
    let mut items = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        items.push(match read_element(version, buf)? {
            Some(body) => deserialize_value(elem, version, body)?,
            // Server-produced nulls inside lists and sets are surfaced
            // rather than rejected.
            None => CqlValue::Null,
        });
    }
    Ok(items)
}

fn read_collection_length(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<usize, DeserializeError> {
    if version.uses_short_collection_lengths() {
        Ok(types::read_short(buf)? as usize)
    } else {
        let len = types::read_int(buf)?;
        usize::try_from(len)
            .map_err(|_| DeserializeError::BadData(format!("negative collection count {len}")))
    }
}

fn read_element<'a>(
    version: ProtocolVersion,
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, DeserializeError> {
    if version.uses_short_collection_lengths() {
        let len = types::read_short(buf)? as usize;
        Ok(Some(
            types::read_raw_bytes(len, buf).map_err(|_| DeserializeError::UnexpectedEof)?,
        ))
    } else {
        let len = types::read_int(buf)?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(
            types::read_raw_bytes(len as usize, buf)
                .map_err(|_| DeserializeError::UnexpectedEof)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use crate::serialize::serialize_value;

    const ALL_VERSIONS: [ProtocolVersion; 5] = [
        ProtocolVersion::V1,
        ProtocolVersion::V2,
        ProtocolVersion::V3,
        ProtocolVersion::V4,
        ProtocolVersion::V5,
    ];

    fn round_trip(value: &CqlValue, typ: &ColumnType) {
        for version in ALL_VERSIONS {
            let mut buf = Vec::new();
            serialize_value(value, typ, version, &mut buf).unwrap();
            let back = deserialize_value(typ, version, &buf).unwrap();
            assert_eq!(&back, value, "round trip failed on {version}");
        }
    }

    #[test]
    fn primitive_round_trips() {
        round_trip(&CqlValue::Boolean(true), &ColumnType::Boolean);
        round_trip(&CqlValue::TinyInt(-1), &ColumnType::TinyInt);
        round_trip(&CqlValue::SmallInt(-32768), &ColumnType::SmallInt);
        round_trip(&CqlValue::Int(i32::MIN), &ColumnType::Int);
        round_trip(&CqlValue::BigInt(i64::MAX), &ColumnType::BigInt);
        round_trip(&CqlValue::Float(3.5), &ColumnType::Float);
        round_trip(&CqlValue::Double(-0.125), &ColumnType::Double);
        round_trip(&CqlValue::Text("żółć".to_owned()), &ColumnType::Text);
        round_trip(&CqlValue::Ascii("plain".to_owned()), &ColumnType::Ascii);
        round_trip(&CqlValue::Blob(vec![0, 1, 255]), &ColumnType::Blob);
        round_trip(
            &CqlValue::Uuid(uuid::Uuid::from_u128(0x1234_5678_9abc_def0)),
            &ColumnType::Uuid,
        );
        round_trip(
            &CqlValue::Inet("2001:db8::1".parse().unwrap()),
            &ColumnType::Inet,
        );
        round_trip(&CqlValue::Counter(Counter(42)), &ColumnType::Counter);
    }

    #[test]
    fn temporal_round_trips_at_boundaries() {
        // Extremes of the wire range: 0 is 2^31 days before the epoch.
        for date in [CqlDate(0), CqlDate(1 << 31), CqlDate(u32::MAX)] {
            round_trip(&CqlValue::Date(date), &ColumnType::Date);
        }
        for time in [CqlTime(0), CqlTime(CqlTime::MAX_NANOS)] {
            round_trip(&CqlValue::Time(time), &ColumnType::Time);
        }
        round_trip(
            &CqlValue::Timestamp(CqlTimestamp(i64::MIN)),
            &ColumnType::Timestamp,
        );
    }

    #[test]
    fn decode_known_timestamp() {
        let bytes = [0x00, 0x00, 0x01, 0x50, 0xac, 0xba, 0x50, 0x00];
        let v = deserialize_value(&ColumnType::Timestamp, ProtocolVersion::V4, &bytes).unwrap();
        // 2015-10-21T00:00:00Z
        assert_eq!(v, CqlValue::Timestamp(CqlTimestamp(1445385600000)));
    }

    #[test]
    fn decode_inet_v4() {
        let v = deserialize_value(
            &ColumnType::Inet,
            ProtocolVersion::V4,
            &[0x01, 0x01, 0x05, 0xff],
        )
        .unwrap();
        assert_eq!(v, CqlValue::Inet("1.1.5.255".parse().unwrap()));
    }

    #[test]
    fn varint_round_trip() {
        for n in [0i64, 1, -1, 127, 128, -128, -129, i64::MAX, i64::MIN] {
            round_trip(&CqlValue::Varint(CqlVarint::from(n)), &ColumnType::Varint);
        }
    }

    #[test]
    fn decimal_round_trip_and_values() {
        use std::str::FromStr;

        let huge = BigDecimal::from_str("79228162514264337593543950335").unwrap();
        round_trip(&CqlValue::Decimal(huge.clone()), &ColumnType::Decimal);

        let shifted = BigDecimal::from_str("79.228162514264337593543950335").unwrap();
        round_trip(&CqlValue::Decimal(shifted.clone()), &ColumnType::Decimal);

        // scale 27 of the same unscaled integer equals the shifted value
        let unscaled = BigInt::from_str("79228162514264337593543950335").unwrap();
        assert_eq!(BigDecimal::from((unscaled, 27)), shifted);
    }

    #[test]
    fn duration_round_trip() {
        round_trip(
            &CqlValue::Duration(CqlDuration {
                months: -3,
                days: 14,
                nanoseconds: 123_456_789,
            }),
            &ColumnType::Duration,
        );
    }

    #[test]
    fn collection_round_trips() {
        let list_typ = ColumnType::List(Box::new(ColumnType::Int));
        round_trip(
            &CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2), CqlValue::Int(3)]),
            &list_typ,
        );

        let set_typ = ColumnType::Set(Box::new(ColumnType::Text));
        round_trip(
            &CqlValue::Set(vec![
                CqlValue::Text("a".into()),
                CqlValue::Text("b".into()),
            ]),
            &set_typ,
        );

        let map_typ = ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Int));
        round_trip(
            &CqlValue::Map(vec![
                (CqlValue::Text("key1".into()), CqlValue::Int(1)),
                (CqlValue::Text("key2".into()), CqlValue::Int(2)),
            ]),
            &map_typ,
        );

        let nested = ColumnType::Map(
            Box::new(ColumnType::Int),
            Box::new(ColumnType::List(Box::new(ColumnType::Text))),
        );
        round_trip(
            &CqlValue::Map(vec![(
                CqlValue::Int(7),
                CqlValue::List(vec![CqlValue::Text("x".into())]),
            )]),
            &nested,
        );
    }

    #[test]
    fn list_accepts_server_nulls() {
        // element count 2: one null (-1) and one real int
        let mut body = Vec::new();
        types::write_int(2, &mut body);
        types::write_int(-1, &mut body);
        types::write_int(4, &mut body);
        types::write_int(9, &mut body);

        let typ = ColumnType::List(Box::new(ColumnType::Int));
        let v = deserialize_value(&typ, ProtocolVersion::V4, &body).unwrap();
        assert_eq!(v, CqlValue::List(vec![CqlValue::Null, CqlValue::Int(9)]));
    }

    #[test]
    fn tuple_round_trip_with_nulls() {
        let typ = ColumnType::Tuple(vec![ColumnType::Int, ColumnType::Text]);
        round_trip(
            &CqlValue::Tuple(vec![Some(CqlValue::Int(1)), None]),
            &typ,
        );
    }

    #[test]
    fn udt_missing_trailing_fields_decode_as_null() {
        let typ = ColumnType::UserDefinedType {
            keyspace: "ks".into(),
            type_name: "t".into(),
            field_types: vec![
                ("a".to_owned(), ColumnType::Int),
                ("b".to_owned(), ColumnType::Text),
            ],
        };
        // Only field "a" on the wire.
        let mut body = Vec::new();
        types::write_int(4, &mut body);
        types::write_int(5, &mut body);
        let v = deserialize_value(&typ, ProtocolVersion::V4, &body).unwrap();
        assert_eq!(
            v,
            CqlValue::UserDefinedType {
                keyspace: "ks".into(),
                type_name: "t".into(),
                fields: vec![
                    ("a".to_owned(), Some(CqlValue::Int(5))),
                    ("b".to_owned(), None),
                ],
            }
        );
    }

    #[test]
    fn vector_round_trips() {
        let fixed = ColumnType::Vector {
            element: Box::new(ColumnType::Float),
            dimension: 3,
        };
        round_trip(
            &CqlValue::Vector(vec![
                CqlValue::Float(1.0),
                CqlValue::Float(2.0),
                CqlValue::Float(3.0),
            ]),
            &fixed,
        );

        let variable = ColumnType::Vector {
            element: Box::new(ColumnType::Text),
            dimension: 2,
        };
        round_trip(
            &CqlValue::Vector(vec![
                CqlValue::Text("ab".into()),
                CqlValue::Text("longer element".into()),
            ]),
            &variable,
        );
    }

    #[test]
    fn empty_body_decodes_to_empty() {
        for version in ALL_VERSIONS {
            assert_eq!(
                deserialize_value(&ColumnType::Int, version, &[]).unwrap(),
                CqlValue::Empty
            );
            // Collections never map empty bodies to Empty.
            let typ = ColumnType::List(Box::new(ColumnType::Int));
            assert!(deserialize_value(&typ, version, &[]).is_err());
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let err =
            deserialize_value(&ColumnType::Boolean, ProtocolVersion::V4, &[1, 0]).unwrap_err();
        assert_matches!(err, DeserializeError::BadLength { .. });

        let typ = ColumnType::List(Box::new(ColumnType::Int));
        let mut body = Vec::new();
        types::write_int(0, &mut body);
        body.push(0xde);
        let err = deserialize_value(&typ, ProtocolVersion::V4, &body).unwrap_err();
        assert_matches!(err, DeserializeError::TrailingBytes(_));
    }
}
