use std::borrow::Cow;
use std::sync::Arc;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, Consistency, SerialConsistency};
use crate::serialize::SerializedValues;
use bytes::{BufMut, Bytes};

// Query parameter flags
const FLAG_VALUES: u32 = 0x01;
const FLAG_SKIP_METADATA: u32 = 0x02;
const FLAG_PAGE_SIZE: u32 = 0x04;
const FLAG_WITH_PAGING_STATE: u32 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;
const FLAG_WITH_NAMES_FOR_VALUES: u32 = 0x40;
const FLAG_WITH_KEYSPACE: u32 = 0x80;

/// An opaque server-issued cursor that resumes a result set at the next
/// page. [`PagingState::start`] denotes the beginning of the result set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagingState(Option<Arc<[u8]>>);

impl PagingState {
    /// Denotes the start of the result set: no paging state on the wire.
    pub fn start() -> Self {
        Self(None)
    }

    pub fn new_from_raw_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(Some(bytes.into()))
    }

    pub fn as_bytes_slice(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }
}

#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        if version == ProtocolVersion::V1 {
            // v1 QUERY is just the statement and a consistency; no binding,
            // no paging.
            if !self.parameters.values.is_empty() {
                return Err(RequestSerializationError::ValuesUnsupported(version));
            }
            types::write_consistency(self.parameters.consistency, buf);
            return Ok(());
        }
        self.parameters.serialize(version, buf)
    }
}

#[derive(Clone)]
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct QueryParameters<'a> {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: PagingState,
    pub skip_metadata: bool,
    /// Per-request keyspace, v5 only.
    pub keyspace: Option<Cow<'a, str>>,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: PagingState::start(),
            skip_metadata: false,
            keyspace: None,
            values: Cow::Borrowed(SerializedValues::EMPTY),
        }
    }
}

impl QueryParameters<'_> {
    /// Serializes the `<query_parameters>` shared by QUERY and EXECUTE
    /// (v2 and newer).
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> Result<(), RequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0u32;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }
        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }
        if self.paging_state.as_bytes_slice().is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            if version < ProtocolVersion::V3 {
                return Err(RequestSerializationError::TimestampUnsupported(version));
            }
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        if self.values.contains_names() {
            if !version.supports_named_values() {
                return Err(RequestSerializationError::NamedValuesUnsupported);
            }
            flags |= FLAG_WITH_NAMES_FOR_VALUES;
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
            debug_assert!(flags <= u8::MAX as u32);
            buf.put_u8(flags as u8);
        }

        if flags & FLAG_VALUES != 0 {
            self.values.write_to_request(buf);
        }
        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }
        if let Some(paging_state) = self.paging_state.as_bytes_slice() {
            types::write_bytes(paging_state, buf)?;
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

/// A paging state as returned by the server alongside a page of rows:
/// either there are more pages (and this state resumes after the current
/// one) or the result set is finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagingStateResponse {
    HasMorePages { state: PagingState },
    NoMorePages,
}

impl PagingStateResponse {
    pub(crate) fn new_from_raw_bytes(raw: Option<&[u8]>) -> Self {
        match raw {
            Some(raw) => Self::HasMorePages {
                state: PagingState::new_from_raw_bytes(raw),
            },
            None => Self::NoMorePages,
        }
    }

    pub fn finished(&self) -> bool {
        matches!(self, Self::NoMorePages)
    }

    /// Converts into the request-side [`PagingState`], `None` when the
    /// result set is finished.
    pub fn into_paging_control_flow(self) -> std::ops::ControlFlow<(), PagingState> {
        match self {
            Self::HasMorePages { state } => std::ops::ControlFlow::Continue(state),
            Self::NoMorePages => std::ops::ControlFlow::Break(()),
        }
    }
}

impl From<Option<Bytes>> for PagingStateResponse {
    fn from(raw: Option<Bytes>) -> Self {
        Self::new_from_raw_bytes(raw.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn v4_flags_and_layout() {
        let params = QueryParameters {
            consistency: Consistency::One,
            page_size: Some(10),
            ..Default::default()
        };
        let mut buf = Vec::new();
        params.serialize(ProtocolVersion::V4, &mut buf).unwrap();
        // consistency ONE, flags = PAGE_SIZE, page size 10
        assert_eq!(buf, [0x00, 0x01, 0x04, 0x00, 0x00, 0x00, 0x0a]);
    }

    #[test]
    fn v5_uses_int_flags_and_keyspace() {
        let params = QueryParameters {
            consistency: Consistency::Quorum,
            keyspace: Some(Cow::Borrowed("ks")),
            ..Default::default()
        };
        let mut buf = Vec::new();
        params.serialize(ProtocolVersion::V5, &mut buf).unwrap();
        assert_eq!(
            buf,
            [0x00, 0x04, 0x00, 0x00, 0x00, 0x80, 0x00, 0x02, b'k', b's']
        );
    }

    #[test]
    fn keyspace_rejected_below_v5() {
        let params = QueryParameters {
            keyspace: Some(Cow::Borrowed("ks")),
            ..Default::default()
        };
        let mut buf = Vec::new();
        assert_matches!(
            params.serialize(ProtocolVersion::V4, &mut buf),
            Err(RequestSerializationError::KeyspaceUnsupported)
        );
    }

    #[test]
    fn v1_query_refuses_values() {
        let mut values = SerializedValues::new();
        values
            .add_value_inferred(
                Some(&crate::value::CqlValue::Int(1)),
                ProtocolVersion::V1,
            )
            .unwrap();
        let query = Query {
            contents: Cow::Borrowed("SELECT * FROM t WHERE a = ?"),
            parameters: QueryParameters {
                values: Cow::Owned(values),
                ..Default::default()
            },
        };
        let mut buf = Vec::new();
        assert_matches!(
            query.serialize(ProtocolVersion::V1, &mut buf),
            Err(RequestSerializationError::ValuesUnsupported(_))
        );
    }
}
