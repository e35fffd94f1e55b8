//! Readers and writers for the protocol's notation types: `[int]`,
//! `[long]`, `[short]`, `[string]`, `[bytes]`, `[value]`, `[uuid]`,
//! `[inet]`, `[consistency]` and the v4+ variable-length integers.

use super::frame_errors::LowLevelDeserializationError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::net::{IpAddr, SocketAddr};
use std::str;
use thiserror::Error;
use uuid::Uuid;

/// Consistency level of a request, as sent in QUERY/EXECUTE/BATCH
/// parameters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl TryFrom<u16> for Consistency {
    type Error = LowLevelDeserializationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            0x000A => Ok(Consistency::LocalOne),
            other => Err(LowLevelDeserializationError::UnknownConsistency(other)),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Serial consistency, used by conditional (LWT) statements.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<u16> for SerialConsistency {
    type Error = LowLevelDeserializationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0008 => Ok(SerialConsistency::Serial),
            0x0009 => Ok(SerialConsistency::LocalSerial),
            other => Err(LowLevelDeserializationError::UnknownSerialConsistency(
                other,
            )),
        }
    }
}

#[derive(Debug, Error)]
#[error("Expected Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A `[value]`: length-prefixed bytes, with -1 meaning null and -2 (v4+)
/// meaning unset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    #[inline]
    pub fn as_value(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            RawValue::Null | RawValue::Unset => None,
        }
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (taken, rest) = buf.split_at(count);
    *buf = rest;
    Ok(taken)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    buf.read_i32::<BigEndian>()
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let v = read_int(buf)?;
    usize::try_from(v).map_err(|_| LowLevelDeserializationError::UnexpectedNegativeLength(v))
}

pub(crate) fn write_int_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_int(i32::try_from(v)?, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    buf.read_i64::<BigEndian>()
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    buf.read_u16::<BigEndian>()
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, std::io::Error> {
    Ok(read_short(buf)?.into())
}

pub(crate) fn write_short_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short(u16::try_from(v)?, buf);
    Ok(())
}

/// Reads `[bytes]`: an `[int]` length that may be negative (null).
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    Ok(Some(read_raw_bytes(len as usize, buf)?))
}

/// Reads `[bytes]` assuming the value is not null.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

/// Reads a `[value]`, distinguishing null (-1) and unset (-2).
pub fn read_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    match len {
        -2 => Ok(RawValue::Unset),
        -1 => Ok(RawValue::Null),
        len if len >= 0 => Ok(RawValue::Value(read_raw_bytes(len as usize, buf)?)),
        len => Err(LowLevelDeserializationError::InvalidValueLength(len)),
    }
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    Ok(str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    Ok(str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut map = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        map.insert(key, val);
    }
    Ok(map)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut list = Vec::with_capacity(len);
    for _ in 0..len {
        list.push(read_string(buf)?.to_owned());
    }
    Ok(list)
}

pub fn write_string_list(
    v: &[String],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for item in v.iter() {
        write_string(item, buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut map = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        map.insert(key, val);
    }
    Ok(map)
}

pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut map = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = Bytes::copy_from_slice(read_bytes(buf)?);
        map.insert(key, val);
    }
    Ok(map)
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;
    // Cannot fail: read_raw_bytes guarantees the slice length.
    let array: &[u8; 16] = raw.try_into().unwrap();
    Ok(Uuid::from_bytes(*array))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(uuid.as_bytes());
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    Consistency::try_from(read_short(buf)?)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// Reads an `[inet]`: address length byte, address bytes, port `[int]`.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let len = buf.read_u8()?;
    let ip = match len {
        4 => IpAddr::from(<[u8; 4]>::try_from(read_raw_bytes(4, buf)?).unwrap()),
        16 => IpAddr::from(<[u8; 16]>::try_from(read_raw_bytes(16, buf)?).unwrap()),
        other => return Err(LowLevelDeserializationError::InvalidInetLength(other)),
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
    write_int(addr.port() as i32, buf);
}

fn zig_zag_encode(v: i64) -> u64 {
    ((v >> 63) ^ (v << 1)) as u64
}

fn zig_zag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub(crate) fn unsigned_vint_encode(v: u64, buf: &mut Vec<u8>) {
    let mut v = v;
    let mut number_of_bytes = (639 - 9 * v.leading_zeros()) >> 6;
    if number_of_bytes <= 1 {
        return buf.put_u8(v as u8);
    }

    if number_of_bytes != 9 {
        let extra_bytes = number_of_bytes - 1;
        let length_bits = !(0xff >> extra_bytes);
        v |= (length_bits as u64) << (8 * extra_bytes);
    } else {
        buf.put_u8(0xff);
        number_of_bytes -= 1;
    }
    buf.put_uint(v, number_of_bytes as usize)
}

pub(crate) fn unsigned_vint_decode(buf: &mut &[u8]) -> Result<u64, std::io::Error> {
    let first_byte = buf.read_u8()?;
    let extra_bytes = first_byte.leading_ones() as usize;

    let mut v = if extra_bytes != 8 {
        let first_byte_bits = first_byte & (0xffu8 >> extra_bytes);
        (first_byte_bits as u64) << (8 * extra_bytes)
    } else {
        0
    };

    if extra_bytes != 0 {
        v += buf.read_uint::<BigEndian>(extra_bytes)?;
    }

    Ok(v)
}

/// Zigzag-encoded variable-length integer, used by the `duration` type.
pub(crate) fn vint_encode(v: i64, buf: &mut Vec<u8>) {
    unsigned_vint_encode(zig_zag_encode(v), buf)
}

pub(crate) fn vint_decode(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    unsigned_vint_decode(buf).map(zig_zag_decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_long_short_round_trip() {
        for val in [i32::MIN, -1, 0, 1, i32::MAX] {
            let mut buf = Vec::new();
            write_int(val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), val);
        }
        for val in [i64::MIN, -1, 0, 1, i64::MAX] {
            let mut buf = Vec::new();
            write_long(val, &mut buf);
            assert_eq!(read_long(&mut &buf[..]).unwrap(), val);
        }
        for val in [0u16, 1, u16::MAX] {
            let mut buf = Vec::new();
            write_short(val, &mut buf);
            assert_eq!(read_short(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn string_round_trip() {
        for val in ["", "hello, world!"] {
            let mut buf = Vec::new();
            write_string(val, &mut buf).unwrap();
            assert_eq!(read_string(&mut &buf[..]).unwrap(), val);

            buf.clear();
            write_long_string(val, &mut buf).unwrap();
            assert_eq!(read_long_string(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn string_map_round_trip() {
        let mut val = HashMap::new();
        val.insert(String::from("CQL_VERSION"), String::from("3.0.0"));
        val.insert(String::from("COMPRESSION"), String::from("lz4"));
        let mut buf = Vec::new();
        write_string_map(&val, &mut buf).unwrap();
        assert_eq!(read_string_map(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn value_markers() {
        let mut buf = Vec::new();
        write_int(-1, &mut buf);
        assert_eq!(read_value(&mut &buf[..]).unwrap(), RawValue::Null);

        buf.clear();
        write_int(-2, &mut buf);
        assert_eq!(read_value(&mut &buf[..]).unwrap(), RawValue::Unset);

        buf.clear();
        write_bytes(&[1, 2, 3], &mut buf).unwrap();
        assert_eq!(
            read_value(&mut &buf[..]).unwrap(),
            RawValue::Value(&[1, 2, 3])
        );

        buf.clear();
        write_int(-3, &mut buf);
        assert!(read_value(&mut &buf[..]).is_err());
    }

    #[test]
    fn uuid_round_trip() {
        let u = Uuid::parse_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap();
        let mut buf = Vec::new();
        write_uuid(&u, &mut buf);
        assert_eq!(read_uuid(&mut &buf[..]).unwrap(), u);
    }

    #[test]
    fn inet_round_trip() {
        use std::net::{Ipv4Addr, Ipv6Addr};

        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042);
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)), 19042);
        for addr in [v4, v6] {
            let mut buf = Vec::new();
            write_inet(addr, &mut buf);
            assert_eq!(read_inet(&mut &buf[..]).unwrap(), addr);
        }
    }

    #[test]
    fn consistency_round_trip() {
        let mut buf = Vec::new();
        write_consistency(Consistency::Quorum, &mut buf);
        assert_eq!(
            read_consistency(&mut &buf[..]).unwrap(),
            Consistency::Quorum
        );

        buf.clear();
        write_short(0x1234, &mut buf);
        assert!(read_consistency(&mut &buf[..]).is_err());
    }

    #[test]
    fn zig_zag() {
        for (plain, encoded) in [(0i64, 0u64), (-1, 1), (1, 2), (-2, 3), (2, 4), (-3, 5)] {
            assert_eq!(zig_zag_encode(plain), encoded);
            assert_eq!(zig_zag_decode(encoded), plain);
        }
    }

    #[test]
    fn vint_round_trip() {
        let mut buf: Vec<u8> = Vec::with_capacity(16);
        let mut check = |n: i64| {
            vint_encode(n, &mut buf);
            assert_eq!(vint_decode(&mut buf.as_slice()).unwrap(), n);
            buf.clear();
        };

        for i in 0..63 {
            check((1 << i) - 1);
            check(1 - (1 << i));
            check(1 << i);
            check(-(1 << i));
        }
        check(i64::MAX);
        check(i64::MIN);
    }

    #[test]
    fn unsigned_vint_minimal_lengths() {
        // One byte up to 127, then one additional byte per 7 bits.
        for (v, expected_len) in [
            (0u64, 1usize),
            (127, 1),
            (128, 2),
            ((1 << 14) - 1, 2),
            (1 << 14, 3),
            ((1 << 21) - 1, 3),
            (1 << 21, 4),
            (u64::MAX, 9),
        ] {
            let mut buf = Vec::new();
            unsigned_vint_encode(v, &mut buf);
            assert_eq!(buf.len(), expected_len, "value {v}");
            assert_eq!(unsigned_vint_decode(&mut buf.as_slice()).unwrap(), v);
        }
    }
}
