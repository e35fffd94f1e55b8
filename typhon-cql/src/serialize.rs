//! Descriptor-driven serialization of [`CqlValue`]s into their wire form.
//!
//! Encodings are parameterized by [`ProtocolVersion`]: collections use
//! `[short]` counts and element lengths up to v2 and `[int]` from v3 on.
//! The functions here write cell *bodies*; the outer length prefix of a
//! bound value is written by the request serializers.

use crate::frame::protocol::ProtocolVersion;
use crate::frame::types;
use crate::value::{ColumnType, CqlTime, CqlValue};
use bigdecimal::BigDecimal;
use bytes::BufMut;
use thiserror::Error;

/// An error raised when a runtime value cannot be encoded.
///
/// These are deterministic programmer errors; the driver never retries
/// them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializeError {
    /// The runtime value's shape is incompatible with the declared type.
    #[error("Cannot encode {got} as CQL type {expected:?}")]
    TypeMismatch {
        expected: ColumnType,
        got: &'static str,
    },
    /// A null element inside a list, set or map.
    #[error("Collections cannot contain null elements")]
    NullInCollection,
    /// A numeric value does not fit its wire representation, e.g. a
    /// decimal scale outside the 32-bit range.
    #[error("Numeric value does not fit its wire representation")]
    Overflow,
    /// A value or collection exceeds the 2 GiB wire length limit.
    #[error("Value too big to be encoded: max 2 GiB allowed")]
    ValueTooBig,
    /// No CQL type can be inferred for the runtime value.
    #[error("Cannot infer a CQL type for {0}")]
    Unencodable(&'static str),
    /// A vector value whose element count differs from the declared
    /// dimension.
    #[error("Vector has {got} elements, declared dimension is {expected}")]
    VectorDimensionMismatch { expected: u16, got: usize },
    /// A `time` value outside 0..=86_399_999_999_999.
    #[error("time value out of range: {0} ns")]
    TimeOutOfRange(i64),
}

impl From<std::num::TryFromIntError> for SerializeError {
    fn from(_: std::num::TryFromIntError) -> Self {
        SerializeError::ValueTooBig
    }
}

fn type_name(value: &CqlValue) -> &'static str {
    match value {
        CqlValue::Null => "null",
        CqlValue::Ascii(_) => "ascii",
        CqlValue::BigInt(_) => "bigint",
        CqlValue::Blob(_) => "blob",
        CqlValue::Boolean(_) => "boolean",
        CqlValue::Counter(_) => "counter",
        CqlValue::Date(_) => "date",
        CqlValue::Decimal(_) => "decimal",
        CqlValue::Double(_) => "double",
        CqlValue::Duration(_) => "duration",
        CqlValue::Empty => "empty",
        CqlValue::Float(_) => "float",
        CqlValue::Inet(_) => "inet",
        CqlValue::Int(_) => "int",
        CqlValue::SmallInt(_) => "smallint",
        CqlValue::Text(_) => "text",
        CqlValue::Time(_) => "time",
        CqlValue::Timestamp(_) => "timestamp",
        CqlValue::Timeuuid(_) => "timeuuid",
        CqlValue::TinyInt(_) => "tinyint",
        CqlValue::Uuid(_) => "uuid",
        CqlValue::Varint(_) => "varint",
        CqlValue::List(_) => "list",
        CqlValue::Map(_) => "map",
        CqlValue::Set(_) => "set",
        CqlValue::Tuple(_) => "tuple",
        CqlValue::UserDefinedType { .. } => "udt",
        CqlValue::Vector(_) => "vector",
    }
}

fn mismatch(expected: &ColumnType, got: &CqlValue) -> SerializeError {
    SerializeError::TypeMismatch {
        expected: expected.clone(),
        got: type_name(got),
    }
}

/// Serializes the body of a single cell into `buf`.
pub fn serialize_value(
    value: &CqlValue,
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), SerializeError> {
    match (typ, value) {
        // Top-level nulls are `None` at the binding layer; a bare Null
        // reaching the serializer is a caller mistake.
        (_, CqlValue::Null) => Err(SerializeError::Unencodable("null")),
        (_, CqlValue::Empty) => Ok(()),

        (ColumnType::Ascii, CqlValue::Ascii(s)) => {
            if !s.is_ascii() {
                return Err(mismatch(typ, value));
            }
            buf.extend_from_slice(s.as_bytes());
            Ok(())
        }
        (ColumnType::Text, CqlValue::Text(s)) | (ColumnType::Text, CqlValue::Ascii(s)) => {
            buf.extend_from_slice(s.as_bytes());
            Ok(())
        }
        (ColumnType::Blob, CqlValue::Blob(b)) => {
            buf.extend_from_slice(b);
            Ok(())
        }
        (ColumnType::Boolean, CqlValue::Boolean(b)) => {
            buf.put_u8(*b as u8);
            Ok(())
        }
        (ColumnType::TinyInt, CqlValue::TinyInt(v)) => {
            buf.put_i8(*v);
            Ok(())
        }
        (ColumnType::SmallInt, CqlValue::SmallInt(v)) => {
            buf.put_i16(*v);
            Ok(())
        }
        (ColumnType::Int, CqlValue::Int(v)) => {
            buf.put_i32(*v);
            Ok(())
        }
        (ColumnType::BigInt, CqlValue::BigInt(v)) => {
            buf.put_i64(*v);
            Ok(())
        }
        (ColumnType::Counter, CqlValue::Counter(c)) => {
            buf.put_i64(c.0);
            Ok(())
        }
        (ColumnType::Float, CqlValue::Float(v)) => {
            buf.put_f32(*v);
            Ok(())
        }
        (ColumnType::Double, CqlValue::Double(v)) => {
            buf.put_f64(*v);
            Ok(())
        }
        (ColumnType::Timestamp, CqlValue::Timestamp(ts)) => {
            buf.put_i64(ts.0);
            Ok(())
        }
        (ColumnType::Date, CqlValue::Date(d)) => {
            buf.put_u32(d.0);
            Ok(())
        }
        (ColumnType::Time, CqlValue::Time(t)) => {
            if !(0..=CqlTime::MAX_NANOS).contains(&t.0) {
                return Err(SerializeError::TimeOutOfRange(t.0));
            }
            buf.put_i64(t.0);
            Ok(())
        }
        (ColumnType::Uuid, CqlValue::Uuid(u)) => {
            buf.extend_from_slice(u.as_bytes());
            Ok(())
        }
        (ColumnType::Timeuuid, CqlValue::Timeuuid(u)) => {
            buf.extend_from_slice(u.0.as_bytes());
            Ok(())
        }
        (ColumnType::Inet, CqlValue::Inet(addr)) => {
            match addr {
                std::net::IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
                std::net::IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
            }
            Ok(())
        }
        (ColumnType::Varint, CqlValue::Varint(v)) => {
            buf.extend_from_slice(v.as_signed_bytes_be_slice());
            Ok(())
        }
        (ColumnType::Decimal, CqlValue::Decimal(d)) => serialize_decimal(d, buf),
        (ColumnType::Duration, CqlValue::Duration(d)) => {
            types::vint_encode(d.months as i64, buf);
            types::vint_encode(d.days as i64, buf);
            types::vint_encode(d.nanoseconds, buf);
            Ok(())
        }

        (ColumnType::List(elem), CqlValue::List(items))
        | (ColumnType::Set(elem), CqlValue::Set(items))
        | (ColumnType::Set(elem), CqlValue::List(items)) => {
            write_collection_length(items.len(), version, buf)?;
            for item in items {
                serialize_element(item, elem, version, buf)?;
            }
            Ok(())
        }
        (ColumnType::Map(key_typ, val_typ), CqlValue::Map(entries)) => {
            write_collection_length(entries.len(), version, buf)?;
            for (k, v) in entries {
                serialize_element(k, key_typ, version, buf)?;
                serialize_element(v, val_typ, version, buf)?;
            }
            Ok(())
        }
        (ColumnType::Tuple(elem_types), CqlValue::Tuple(elems)) => {
            if elems.len() > elem_types.len() {
                return Err(mismatch(typ, value));
            }
            for (elem, elem_typ) in elems.iter().zip(elem_types) {
                serialize_optional_cell(elem.as_ref(), elem_typ, version, buf)?;
            }
            // Missing trailing elements are sent as nulls to keep the
            // declared arity.
            for _ in elems.len()..elem_types.len() {
                types::write_int(-1, buf);
            }
            Ok(())
        }
        (
            ColumnType::UserDefinedType { field_types, .. },
            CqlValue::UserDefinedType { fields, .. },
        ) => {
            if fields.len() > field_types.len() {
                return Err(mismatch(typ, value));
            }
            for ((_, field_value), (_, field_typ)) in fields.iter().zip(field_types) {
                serialize_optional_cell(field_value.as_ref(), field_typ, version, buf)?;
            }
            for _ in fields.len()..field_types.len() {
                types::write_int(-1, buf);
            }
            Ok(())
        }
        (
            ColumnType::Vector { element, dimension },
            CqlValue::Vector(items),
        ) => {
            if items.len() != *dimension as usize {
                return Err(SerializeError::VectorDimensionMismatch {
                    expected: *dimension,
                    got: items.len(),
                });
            }
            if element.fixed_size().is_some() {
                for item in items {
                    serialize_value(item, element, version, buf)?;
                }
            } else {
                for item in items {
                    let mut body = Vec::new();
                    serialize_value(item, element, version, &mut body)?;
                    types::unsigned_vint_encode(body.len() as u64, buf);
                    buf.extend_from_slice(&body);
                }
            }
            Ok(())
        }
        (ColumnType::Custom(_), _) => Err(mismatch(typ, value)),

        _ => Err(mismatch(typ, value)),
    }
}

/// Serializes a cell with its `[int]` length prefix; `None` becomes null.
pub fn serialize_optional_cell(
    value: Option<&CqlValue>,
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), SerializeError> {
    match value {
        None | Some(CqlValue::Null) => {
            types::write_int(-1, buf);
            Ok(())
        }
        Some(v) => {
            let length_pos = buf.len();
            types::write_int(0, buf);
            serialize_value(v, typ, version, buf)?;
            patch_length(buf, length_pos, 4)?;
            Ok(())
        }
    }
}

fn serialize_decimal(d: &BigDecimal, buf: &mut Vec<u8>) -> Result<(), SerializeError> {
    let (unscaled, scale) = d.as_bigint_and_exponent();
    let scale: i32 = scale.try_into().map_err(|_| SerializeError::Overflow)?;
    buf.put_i32(scale);
    buf.extend_from_slice(&unscaled.to_signed_bytes_be());
    Ok(())
}

/// Serializes a collection element: length prefix (version-dependent
/// width) followed by the body. Null elements are rejected.
fn serialize_element(
    value: &CqlValue,
    typ: &ColumnType,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), SerializeError> {
    if matches!(value, CqlValue::Null) {
        return Err(SerializeError::NullInCollection);
    }
    let prefix_len = if version.uses_short_collection_lengths() {
        2
    } else {
        4
    };
    let length_pos = buf.len();
    buf.resize(buf.len() + prefix_len, 0);
    serialize_value(value, typ, version, buf)?;
    patch_length(buf, length_pos, prefix_len)
}

fn write_collection_length(
    len: usize,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), SerializeError> {
    if version.uses_short_collection_lengths() {
        types::write_short_length(len, buf).map_err(|_| SerializeError::ValueTooBig)
    } else {
        types::write_int_length(len, buf).map_err(|_| SerializeError::ValueTooBig)
    }
}

/// Back-patches a length prefix of `prefix_len` bytes at `length_pos` with
/// the number of bytes written after it.
fn patch_length(
    buf: &mut [u8],
    length_pos: usize,
    prefix_len: usize,
) -> Result<(), SerializeError> {
    let body_len = buf.len() - length_pos - prefix_len;
    match prefix_len {
        2 => {
            let len: u16 = body_len.try_into().map_err(|_| SerializeError::ValueTooBig)?;
            buf[length_pos..length_pos + 2].copy_from_slice(&len.to_be_bytes());
        }
        4 => {
            let len: i32 = body_len.try_into().map_err(|_| SerializeError::ValueTooBig)?;
            buf[length_pos..length_pos + 4].copy_from_slice(&len.to_be_bytes());
        }
        _ => unreachable!("length prefixes are 2 or 4 bytes"),
    }
    Ok(())
}

/// Infers a [`ColumnType`] descriptor from a runtime value, for callers
/// that bind values without supplying metadata. Collections must be
/// non-empty and homogeneous.
pub fn infer_column_type(value: &CqlValue) -> Result<ColumnType, SerializeError> {
    Ok(match value {
        CqlValue::Ascii(_) => ColumnType::Ascii,
        CqlValue::BigInt(_) => ColumnType::BigInt,
        CqlValue::Blob(_) => ColumnType::Blob,
        CqlValue::Boolean(_) => ColumnType::Boolean,
        CqlValue::Counter(_) => ColumnType::Counter,
        CqlValue::Date(_) => ColumnType::Date,
        CqlValue::Decimal(_) => ColumnType::Decimal,
        CqlValue::Double(_) => ColumnType::Double,
        CqlValue::Duration(_) => ColumnType::Duration,
        CqlValue::Float(_) => ColumnType::Float,
        CqlValue::Inet(_) => ColumnType::Inet,
        CqlValue::Int(_) => ColumnType::Int,
        CqlValue::SmallInt(_) => ColumnType::SmallInt,
        CqlValue::Text(_) => ColumnType::Text,
        CqlValue::Time(_) => ColumnType::Time,
        CqlValue::Timestamp(_) => ColumnType::Timestamp,
        CqlValue::Timeuuid(_) => ColumnType::Timeuuid,
        CqlValue::TinyInt(_) => ColumnType::TinyInt,
        CqlValue::Uuid(_) => ColumnType::Uuid,
        CqlValue::Varint(_) => ColumnType::Varint,
        CqlValue::List(items) => {
            let elem = infer_element_type(items)?;
            ColumnType::List(Box::new(elem))
        }
        CqlValue::Set(items) => {
            let elem = infer_element_type(items)?;
            ColumnType::Set(Box::new(elem))
        }
        CqlValue::Map(entries) => {
            let (first_key, first_val) =
                entries.first().ok_or(SerializeError::Unencodable("empty map"))?;
            ColumnType::Map(
                Box::new(infer_column_type(first_key)?),
                Box::new(infer_column_type(first_val)?),
            )
        }
        CqlValue::Tuple(elems) => {
            let mut types = Vec::with_capacity(elems.len());
            for elem in elems {
                let elem = elem
                    .as_ref()
                    .ok_or(SerializeError::Unencodable("tuple with null element"))?;
                types.push(infer_column_type(elem)?);
            }
            ColumnType::Tuple(types)
        }
        CqlValue::Null | CqlValue::Empty | CqlValue::UserDefinedType { .. } | CqlValue::Vector(_) => {
            return Err(SerializeError::Unencodable(type_name(value)))
        }
    })
}

fn infer_element_type(items: &[CqlValue]) -> Result<ColumnType, SerializeError> {
    let first = items
        .first()
        .ok_or(SerializeError::Unencodable("empty collection"))?;
    infer_column_type(first)
}

/// Bound values of a single statement, already in wire form.
///
/// Stores the concatenated `[value]`s (optionally preceded by their names)
/// so the request serializer can copy them straight into the frame body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
    contains_names: bool,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues {
        serialized_values: Vec::new(),
        element_count: 0,
        contains_names: false,
    };

    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional value. `None` is sent as null.
    pub fn add_value(
        &mut self,
        value: Option<&CqlValue>,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<(), SerializeError> {
        if self.contains_names {
            return Err(SerializeError::Unencodable(
                "cannot mix named and positional values",
            ));
        }
        serialize_optional_cell(value, typ, version, &mut self.serialized_values)?;
        self.bump_count()
    }

    /// Appends a positional value, inferring its type from the runtime
    /// shape.
    pub fn add_value_inferred(
        &mut self,
        value: Option<&CqlValue>,
        version: ProtocolVersion,
    ) -> Result<(), SerializeError> {
        match value {
            None => {
                if self.contains_names {
                    return Err(SerializeError::Unencodable(
                        "cannot mix named and positional values",
                    ));
                }
                types::write_int(-1, &mut self.serialized_values);
                self.bump_count()
            }
            Some(v) => {
                let typ = infer_column_type(v)?;
                self.add_value(value, &typ, version)
            }
        }
    }

    /// Appends a named value. Requires protocol v3 or newer; the request
    /// serializer validates the version.
    pub fn add_named_value(
        &mut self,
        name: &str,
        value: Option<&CqlValue>,
        typ: &ColumnType,
        version: ProtocolVersion,
    ) -> Result<(), SerializeError> {
        if !self.contains_names && self.element_count > 0 {
            return Err(SerializeError::Unencodable(
                "cannot mix named and positional values",
            ));
        }
        self.contains_names = true;
        types::write_string(name, &mut self.serialized_values)
            .map_err(|_| SerializeError::ValueTooBig)?;
        serialize_optional_cell(value, typ, version, &mut self.serialized_values)?;
        self.bump_count()
    }

    /// Appends the v4+ unset marker.
    pub fn add_unset(&mut self, version: ProtocolVersion) -> Result<(), SerializeError> {
        if !version.supports_unset() {
            return Err(SerializeError::Unencodable(
                "unset values require protocol v4",
            ));
        }
        types::write_int(-2, &mut self.serialized_values);
        self.bump_count()
    }

    fn bump_count(&mut self) -> Result<(), SerializeError> {
        self.element_count = self
            .element_count
            .checked_add(1)
            .ok_or(SerializeError::ValueTooBig)?;
        Ok(())
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn contains_names(&self) -> bool {
        self.contains_names
    }

    /// Writes the value count and the raw values into a request body.
    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized_values);
    }

    /// Iterates over positional values as [`types::RawValue`]s, e.g. for
    /// partition-key extraction. Empty iterator when values are named.
    pub fn iter(&self) -> impl Iterator<Item = types::RawValue<'_>> {
        let mut buf = if self.contains_names {
            &[][..]
        } else {
            &self.serialized_values[..]
        };
        std::iter::from_fn(move || types::read_value(&mut buf).ok())
    }

    /// The positional value at `index`, if present and positional.
    pub fn get(&self, index: usize) -> Option<types::RawValue<'_>> {
        self.iter().nth(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use crate::value::CqlTimestamp;

    fn encoded(value: &CqlValue, typ: &ColumnType, version: ProtocolVersion) -> Vec<u8> {
        let mut buf = Vec::new();
        serialize_value(value, typ, version, &mut buf).unwrap();
        buf
    }

    #[test]
    fn byte_stable_primitives() {
        for version in [
            ProtocolVersion::V1,
            ProtocolVersion::V3,
            ProtocolVersion::V5,
        ] {
            assert_eq!(
                encoded(&CqlValue::Double(1.0), &ColumnType::Double, version),
                [0x3f, 0xf0, 0, 0, 0, 0, 0, 0]
            );
            assert_eq!(
                encoded(&CqlValue::Double(2.2), &ColumnType::Double, version),
                [0x40, 0x01, 0x99, 0x99, 0x99, 0x99, 0x99, 0x9a]
            );
            assert_eq!(
                encoded(&CqlValue::Float(-1.0), &ColumnType::Float, version),
                [0xbf, 0x80, 0x00, 0x00]
            );
            assert_eq!(
                encoded(
                    &CqlValue::Text("abc".to_owned()),
                    &ColumnType::Text,
                    version
                ),
                [0x61, 0x62, 0x63]
            );
            assert_eq!(
                encoded(&CqlValue::TinyInt(-1), &ColumnType::TinyInt, version),
                [0xff]
            );
            assert_eq!(
                encoded(&CqlValue::TinyInt(127), &ColumnType::TinyInt, version),
                [0x7f]
            );
        }
    }

    #[test]
    fn timestamp_bytes() {
        assert_eq!(
            encoded(
                &CqlValue::Timestamp(CqlTimestamp(1445385600000)),
                &ColumnType::Timestamp,
                ProtocolVersion::V4
            ),
            [0x00, 0x00, 0x01, 0x50, 0xac, 0xba, 0x50, 0x00]
        );
    }

    #[test]
    fn inet_bytes() {
        assert_eq!(
            encoded(
                &CqlValue::Inet("1.1.5.255".parse().unwrap()),
                &ColumnType::Inet,
                ProtocolVersion::V4
            ),
            [0x01, 0x01, 0x05, 0xff]
        );
    }

    #[test]
    fn map_text_int_v3_bytes() {
        let map = CqlValue::Map(vec![
            (CqlValue::Text("key1".into()), CqlValue::Int(1)),
            (CqlValue::Text("key2".into()), CqlValue::Int(2)),
        ]);
        let typ = ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Int));
        let expected: &[u8] = &[
            0, 0, 0, 2, // element count
            0, 0, 0, 4, b'k', b'e', b'y', b'1', 0, 0, 0, 4, 0, 0, 0, 1, // "key1" -> 1
            0, 0, 0, 4, b'k', b'e', b'y', b'2', 0, 0, 0, 4, 0, 0, 0, 2, // "key2" -> 2
        ];
        assert_eq!(encoded(&map, &typ, ProtocolVersion::V3), expected);
    }

    #[test]
    fn collections_use_short_lengths_before_v3() {
        let list = CqlValue::List(vec![CqlValue::Int(7)]);
        let typ = ColumnType::List(Box::new(ColumnType::Int));
        assert_eq!(
            encoded(&list, &typ, ProtocolVersion::V2),
            [0, 1, 0, 4, 0, 0, 0, 7]
        );
        assert_eq!(
            encoded(&list, &typ, ProtocolVersion::V3),
            [0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 7]
        );
    }

    #[test]
    fn null_in_collection_is_rejected() {
        let list = CqlValue::List(vec![
            CqlValue::Text("a".into()),
            CqlValue::Null,
            CqlValue::Text("b".into()),
        ]);
        let typ = ColumnType::List(Box::new(ColumnType::Text));
        let mut buf = Vec::new();
        let err = serialize_value(&list, &typ, ProtocolVersion::V4, &mut buf).unwrap_err();
        assert_eq!(err, SerializeError::NullInCollection);

        let map = CqlValue::Map(vec![
            (CqlValue::Text("k1".into()), CqlValue::Text("v".into())),
            (CqlValue::Text("k2".into()), CqlValue::Null),
        ]);
        let typ = ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text));
        let mut buf = Vec::new();
        let err = serialize_value(&map, &typ, ProtocolVersion::V4, &mut buf).unwrap_err();
        assert_eq!(err, SerializeError::NullInCollection);
    }

    #[test]
    fn type_mismatch_is_invalid_type() {
        let mut buf = Vec::new();
        let err = serialize_value(
            &CqlValue::Int(1),
            &ColumnType::Text,
            ProtocolVersion::V4,
            &mut buf,
        )
        .unwrap_err();
        assert_matches!(err, SerializeError::TypeMismatch { .. });
    }

    #[test]
    fn time_range_is_validated() {
        let mut buf = Vec::new();
        let err = serialize_value(
            &CqlValue::Time(CqlTime(CqlTime::MAX_NANOS + 1)),
            &ColumnType::Time,
            ProtocolVersion::V4,
            &mut buf,
        )
        .unwrap_err();
        assert_eq!(err, SerializeError::TimeOutOfRange(CqlTime::MAX_NANOS + 1));
    }

    #[test]
    fn vector_fixed_elements_are_packed() {
        let vec3 = CqlValue::Vector(vec![
            CqlValue::Float(1.0),
            CqlValue::Float(0.0),
            CqlValue::Float(-1.0),
        ]);
        let typ = ColumnType::Vector {
            element: Box::new(ColumnType::Float),
            dimension: 3,
        };
        let bytes = encoded(&vec3, &typ, ProtocolVersion::V4);
        // Three packed floats, no per-element prefixes.
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], [0x3f, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn vector_dimension_is_checked() {
        let typ = ColumnType::Vector {
            element: Box::new(ColumnType::Float),
            dimension: 3,
        };
        let mut buf = Vec::new();
        let err = serialize_value(
            &CqlValue::Vector(vec![CqlValue::Float(1.0)]),
            &typ,
            ProtocolVersion::V4,
            &mut buf,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SerializeError::VectorDimensionMismatch {
                expected: 3,
                got: 1
            }
        );
    }

    #[test]
    fn inference_covers_primitives_and_collections() {
        assert_eq!(
            infer_column_type(&CqlValue::Int(1)).unwrap(),
            ColumnType::Int
        );
        assert_eq!(
            infer_column_type(&CqlValue::List(vec![CqlValue::Text("x".into())])).unwrap(),
            ColumnType::List(Box::new(ColumnType::Text))
        );
        assert_matches!(
            infer_column_type(&CqlValue::List(vec![])),
            Err(SerializeError::Unencodable(_))
        );
    }
}
