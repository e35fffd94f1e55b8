//! The dynamic CQL value model: [`ColumnType`] describes the declared type
//! of a column or bind marker, [`CqlValue`] is the runtime representation
//! of a single cell.

use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// A counter column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Counter(pub i64);

/// Native `date` representation: days since -5877641-06-23, i.e. the unix
/// epoch is `1 << 31`. Allows the full wire range of dates, wider than any
/// calendar crate supports.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct CqlDate(pub u32);

/// Native `timestamp` representation: signed milliseconds since the unix
/// epoch.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct CqlTimestamp(pub i64);

/// Native `time` representation: nanoseconds since midnight,
/// 0..86_399_999_999_999.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct CqlTime(pub i64);

impl CqlTime {
    pub const MAX_NANOS: i64 = 86_399_999_999_999;
}

/// Native `timeuuid`. Compares in timestamp order, per server semantics,
/// but here only equality is needed so it wraps [`Uuid`] directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct CqlTimeuuid(pub Uuid);

/// Native `duration`: months, days and nanoseconds are independent and may
/// have different signs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanoseconds: i64,
}

/// Native `varint`: an arbitrary-precision two's-complement big-endian
/// integer, stored in its minimal wire form.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CqlVarint(Vec<u8>);

impl CqlVarint {
    /// Wraps raw two's-complement big-endian bytes, normalizing to the
    /// minimal representation the wire format requires.
    pub fn from_signed_bytes_be(bytes: Vec<u8>) -> Self {
        let as_int = BigInt::from_signed_bytes_be(&bytes);
        Self(as_int.to_signed_bytes_be())
    }

    pub fn as_signed_bytes_be_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<BigInt> for CqlVarint {
    fn from(value: BigInt) -> Self {
        Self(value.to_signed_bytes_be())
    }
}

impl From<&CqlVarint> for BigInt {
    fn from(value: &CqlVarint) -> Self {
        BigInt::from_signed_bytes_be(&value.0)
    }
}

impl From<i64> for CqlVarint {
    fn from(value: i64) -> Self {
        BigInt::from(value).into()
    }
}

/// An error raised when a value does not fit the target representation,
/// e.g. a `decimal` whose scale exceeds a fixed-precision host decimal.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Value is out of representable range for the requested conversion")]
pub struct ValueOverflow;

/// Identifies the table a column belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

impl TableSpec {
    pub fn new(ks_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            ks_name: ks_name.into(),
            table_name: table_name.into(),
        }
    }
}

/// The declared type of a column, bind marker or collection element.
///
/// A descriptor tree: composite variants fully determine the shapes of
/// their children at all depths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Inet,
    Int,
    SmallInt,
    Text,
    Time,
    Timestamp,
    Timeuuid,
    TinyInt,
    Uuid,
    Varint,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Tuple(Vec<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        /// Field order matches the type declaration; encoding relies on it.
        field_types: Vec<(String, ColumnType)>,
    },
    /// A fixed-dimension vector of `element` values.
    Vector {
        element: Box<ColumnType>,
        dimension: u16,
    },
    /// A server-side custom type the driver does not interpret.
    Custom(String),
}

impl ColumnType {
    /// The wire size of a single element, for types whose encoding always
    /// occupies the same number of bytes. Vectors of such elements are
    /// packed without per-element length prefixes.
    pub(crate) fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnType::Boolean | ColumnType::TinyInt => Some(1),
            ColumnType::SmallInt => Some(2),
            ColumnType::Int | ColumnType::Float | ColumnType::Date => Some(4),
            ColumnType::BigInt
            | ColumnType::Double
            | ColumnType::Timestamp
            | ColumnType::Time
            | ColumnType::Counter => Some(8),
            ColumnType::Uuid | ColumnType::Timeuuid => Some(16),
            _ => None,
        }
    }

    /// Whether a zero-length cell body decodes to the special
    /// [`CqlValue::Empty`] rather than being parsed structurally. Matches
    /// the set of types the server accepts empty values for.
    pub(crate) fn supports_special_empty_value(&self) -> bool {
        !matches!(
            self,
            ColumnType::Counter
                | ColumnType::Duration
                | ColumnType::List(_)
                | ColumnType::Map(_, _)
                | ColumnType::Set(_)
                | ColumnType::UserDefinedType { .. }
                | ColumnType::Vector { .. }
                | ColumnType::Custom(_)
        )
    }
}

/// A single column of row or bind-marker metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

/// The runtime representation of a single CQL cell.
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    /// A null element inside a decoded collection. Top-level nulls are
    /// expressed as `Option::None`; encoding this variant always fails.
    Null,
    Ascii(String),
    BigInt(i64),
    Blob(Vec<u8>),
    Boolean(bool),
    Counter(Counter),
    Date(CqlDate),
    Decimal(BigDecimal),
    Double(f64),
    Duration(CqlDuration),
    /// A zero-length cell body for a type that admits one; distinct from
    /// null and from any natural value of the type.
    Empty,
    Float(f32),
    Inet(IpAddr),
    Int(i32),
    SmallInt(i16),
    Text(String),
    Time(CqlTime),
    Timestamp(CqlTimestamp),
    Timeuuid(CqlTimeuuid),
    TinyInt(i8),
    Uuid(Uuid),
    Varint(CqlVarint),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    Tuple(Vec<Option<CqlValue>>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        /// Field order must match the UDT declaration.
        fields: Vec<(String, Option<CqlValue>)>,
    },
    Vector(Vec<CqlValue>),
}

impl CqlValue {
    pub fn as_ascii(&self) -> Option<&String> {
        match self {
            Self::Ascii(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&String> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_smallint(&self) -> Option<i16> {
        match self {
            Self::SmallInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_tinyint(&self) -> Option<i8> {
        match self {
            Self::TinyInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<Counter> {
        match self {
            Self::Counter(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_timeuuid(&self) -> Option<CqlTimeuuid> {
        match self {
            Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Vec<u8>> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_cql_date(&self) -> Option<CqlDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_cql_time(&self) -> Option<CqlTime> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_cql_timestamp(&self) -> Option<CqlTimestamp> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_cql_duration(&self) -> Option<CqlDuration> {
        match self {
            Self::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Vec<CqlValue>> {
        match self {
            Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Vec<Option<CqlValue>>> {
        match self {
            Self::Tuple(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_udt(&self) -> Option<&Vec<(String, Option<CqlValue>)>> {
        match self {
            Self::UserDefinedType { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) | Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_decimal(self) -> Option<BigDecimal> {
        match self {
            Self::Decimal(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_cql_varint(self) -> Option<CqlVarint> {
        match self {
            Self::Varint(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(feature = "chrono-04")]
mod chrono_conversions {
    use super::{CqlDate, CqlTime, CqlTimestamp, ValueOverflow};
    use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};

    impl From<NaiveDate> for CqlDate {
        fn from(value: NaiveDate) -> Self {
            let unix_epoch = NaiveDate::from_yo_opt(1970, 1).unwrap();
            // chrono's range is a strict subset of the wire range, so the
            // bias addition cannot overflow.
            Self(((1 << 31) + value.signed_duration_since(unix_epoch).num_days()) as u32)
        }
    }

    impl TryFrom<CqlDate> for NaiveDate {
        type Error = ValueOverflow;

        fn try_from(value: CqlDate) -> Result<Self, Self::Error> {
            let days_since_epoch =
                chrono::Duration::try_days(value.0 as i64 - (1 << 31)).ok_or(ValueOverflow)?;
            NaiveDate::from_yo_opt(1970, 1)
                .unwrap()
                .checked_add_signed(days_since_epoch)
                .ok_or(ValueOverflow)
        }
    }

    impl From<DateTime<Utc>> for CqlTimestamp {
        fn from(value: DateTime<Utc>) -> Self {
            Self(value.timestamp_millis())
        }
    }

    impl TryFrom<CqlTimestamp> for DateTime<Utc> {
        type Error = ValueOverflow;

        fn try_from(value: CqlTimestamp) -> Result<Self, Self::Error> {
            match Utc.timestamp_millis_opt(value.0) {
                chrono::LocalResult::Single(dt) => Ok(dt),
                _ => Err(ValueOverflow),
            }
        }
    }

    impl TryFrom<NaiveTime> for CqlTime {
        type Error = ValueOverflow;

        fn try_from(value: NaiveTime) -> Result<Self, Self::Error> {
            let nanos = value.hour() as i64 * 3_600_000_000_000
                + value.minute() as i64 * 60_000_000_000
                + value.second() as i64 * 1_000_000_000
                + value.nanosecond() as i64;
            // Leap-second representation pushes nanosecond() over 10^9.
            if nanos > CqlTime::MAX_NANOS {
                return Err(ValueOverflow);
            }
            Ok(Self(nanos))
        }
    }

    impl TryFrom<CqlTime> for NaiveTime {
        type Error = ValueOverflow;

        fn try_from(value: CqlTime) -> Result<Self, Self::Error> {
            if !(0..=CqlTime::MAX_NANOS).contains(&value.0) {
                return Err(ValueOverflow);
            }
            let secs = (value.0 / 1_000_000_000) as u32;
            let nanos = (value.0 % 1_000_000_000) as u32;
            NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or(ValueOverflow)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_is_normalized() {
        // 0x00 0x01 is a non-minimal encoding of 1.
        let v = CqlVarint::from_signed_bytes_be(vec![0x00, 0x01]);
        assert_eq!(v.as_signed_bytes_be_slice(), &[0x01]);

        // 0xFF is -1 and is already minimal.
        let v = CqlVarint::from_signed_bytes_be(vec![0xff]);
        assert_eq!(v.as_signed_bytes_be_slice(), &[0xff]);

        // A positive number with the high bit set needs a leading zero.
        let v: CqlVarint = BigInt::from(128).into();
        assert_eq!(v.as_signed_bytes_be_slice(), &[0x00, 0x80]);
    }

    #[test]
    fn fixed_sizes() {
        assert_eq!(ColumnType::Float.fixed_size(), Some(4));
        assert_eq!(ColumnType::Uuid.fixed_size(), Some(16));
        assert_eq!(ColumnType::Text.fixed_size(), None);
        assert_eq!(ColumnType::Inet.fixed_size(), None);
    }
}
