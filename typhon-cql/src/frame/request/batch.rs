use std::borrow::Cow;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, Consistency, SerialConsistency};
use crate::serialize::SerializedValues;
use bytes::{BufMut, Bytes};

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;
const FLAG_WITH_KEYSPACE: u32 = 0x80;

/// The batch kind byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

/// One child of a batch: either raw CQL text or a prepared statement id.
#[derive(Debug, Clone)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Cow<'a, Bytes> },
}

pub struct Batch<'a> {
    pub batch_type: BatchType,
    pub statements: Vec<BatchStatement<'a>>,
    pub values: Vec<Cow<'a, SerializedValues>>,
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    /// Per-request keyspace, v5 only.
    pub keyspace: Option<Cow<'a, str>>,
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        if version < ProtocolVersion::V2 {
            return Err(RequestSerializationError::BatchUnsupported);
        }
        debug_assert_eq!(self.statements.len(), self.values.len());

        buf.put_u8(self.batch_type as u8);
        types::write_short_length(self.statements.len(), buf)?;

        for (statement, values) in self.statements.iter().zip(self.values.iter()) {
            if values.contains_names() {
                // The protocol reserves a named-values flag for batches but
                // the servers reject it; the driver refuses early.
                return Err(RequestSerializationError::NamedValuesUnsupported);
            }
            match statement {
                BatchStatement::Query { text } => {
                    buf.put_u8(0);
                    types::write_long_string(text, buf)?;
                }
                BatchStatement::Prepared { id } => {
                    buf.put_u8(1);
                    types::write_short_bytes(id, buf)?;
                }
            }
            values.write_to_request(buf);
        }

        types::write_consistency(self.consistency, buf);

        if version == ProtocolVersion::V2 {
            // v2 batches end at the consistency.
            if self.serial_consistency.is_some() || self.timestamp.is_some() {
                return Err(RequestSerializationError::TimestampUnsupported(version));
            }
            return Ok(());
        }

        let mut flags = 0u32;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        if self.keyspace.is_some() {
            if !version.supports_per_request_keyspace() {
                return Err(RequestSerializationError::KeyspaceUnsupported);
            }
            flags |= FLAG_WITH_KEYSPACE;
        }

        if version.uses_int_query_flags() {
            buf.put_u32(flags);
        } else {
            buf.put_u8(flags as u8);
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }
        if let Some(keyspace) = &self.keyspace {
            types::write_string(keyspace, buf)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn simple_batch_layout_v4() {
        let batch = Batch {
            batch_type: BatchType::Unlogged,
            statements: vec![BatchStatement::Query {
                text: Cow::Borrowed("INSERT INTO t (a) VALUES (1)"),
            }],
            values: vec![Cow::Borrowed(SerializedValues::EMPTY)],
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
            keyspace: None,
        };
        let mut buf = Vec::new();
        batch.serialize(ProtocolVersion::V4, &mut buf).unwrap();

        assert_eq!(buf[0], 1); // unlogged
        assert_eq!(&buf[1..3], [0, 1]); // one statement
        assert_eq!(buf[3], 0); // kind: query string
        let text_len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        assert_eq!(text_len, 28);
        // values count, consistency, empty flags byte
        let tail = &buf[8 + text_len..];
        assert_eq!(tail, [0, 0, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn batch_requires_v2() {
        let batch = Batch {
            batch_type: BatchType::Logged,
            statements: vec![],
            values: vec![],
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
            keyspace: None,
        };
        let mut buf = Vec::new();
        assert_matches!(
            batch.serialize(ProtocolVersion::V1, &mut buf),
            Err(RequestSerializationError::BatchUnsupported)
        );
    }
}
