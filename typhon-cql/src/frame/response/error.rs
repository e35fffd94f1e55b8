//! The ERROR response and the [`DbError`] taxonomy.

use crate::frame::frame_errors::ResponseParseError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::types::{self, Consistency};
use bytes::Bytes;
use thiserror::Error;

/// An ERROR response: a server-reported error code plus a human-readable
/// reason.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, ResponseParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => {
                let consistency = types::read_consistency(buf)?;
                let received = types::read_int(buf)?;
                let required = types::read_int(buf)?;
                let data_present = read_u8(buf)? != 0;
                DbError::ReadTimeout {
                    consistency,
                    received,
                    required,
                    data_present,
                }
            }
            0x1300 => {
                let consistency = types::read_consistency(buf)?;
                let received = types::read_int(buf)?;
                let required = types::read_int(buf)?;
                let numfailures = read_failures(version, buf)?;
                let data_present = read_u8(buf)? != 0;
                DbError::ReadFailure {
                    consistency,
                    received,
                    required,
                    numfailures,
                    data_present,
                }
            }
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_owned(),
                function: types::read_string(buf)?.to_owned(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => {
                let consistency = types::read_consistency(buf)?;
                let received = types::read_int(buf)?;
                let required = types::read_int(buf)?;
                let numfailures = read_failures(version, buf)?;
                let write_type = WriteType::from(types::read_string(buf)?);
                DbError::WriteFailure {
                    consistency,
                    received,
                    required,
                    numfailures,
                    write_type,
                }
            }
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_owned(),
                table: types::read_string(buf)?.to_owned(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            },
            _ => DbError::Other(code),
        };

        // An unknown error code may carry a payload the driver cannot
        // interpret; swallow it rather than reporting trailing garbage.
        if matches!(error, DbError::Other(_)) {
            *buf = &[];
        }

        Ok(Error { error, reason })
    }
}

fn read_u8(buf: &mut &[u8]) -> Result<u8, ResponseParseError> {
    use crate::frame::frame_errors::LowLevelDeserializationError;
    use byteorder::ReadBytesExt;
    Ok(buf.read_u8().map_err(LowLevelDeserializationError::from)?)
}

/// Failure counts were a plain `[int]` until v5 replaced them with a
/// reason map keyed by replica address.
fn read_failures(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<i32, ResponseParseError> {
    if version < ProtocolVersion::V5 {
        return Ok(types::read_int(buf)?);
    }
    let count = types::read_int(buf)?;
    for _ in 0..count {
        // [inetaddr]: length byte + raw address, then a [short] error code.
        let addr_len = read_u8(buf)? as usize;
        let _ = types::read_raw_bytes(addr_len, buf)?;
        let _ = types::read_short(buf)?;
    }
    Ok(count)
}

/// An error code sent by the server in an ERROR response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Something unexpected happened server-side.
    #[error("Internal server error")]
    ServerError,

    /// The server and the driver disagree on the protocol; triggers
    /// version negotiation during the handshake.
    #[error("Protocol violation reported by the server")]
    ProtocolError,

    /// Bad credentials; never retried.
    #[error("Authentication failed - bad credentials")]
    AuthenticationError,

    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("The coordinator is overloaded")]
    Overloaded,

    #[error("The coordinator is still bootstrapping")]
    IsBootstrapping,

    #[error("Error during truncate operation")]
    TruncateError,

    #[error(
        "Not enough replicas responded to the write in time \
        (consistency: {consistency}, received: {received}, required: {required}, \
        write_type: {write_type})"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    #[error(
        "Not enough replicas responded to the read in time \
        (consistency: {consistency}, received: {received}, required: {required}, \
        data_present: {data_present})"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    #[error(
        "A non-timeout failure during the read \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, data_present: {data_present})"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    #[error(
        "A non-timeout failure during the write \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, write_type: {write_type})"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    #[error(
        "User defined function failed \
        (keyspace: {keyspace}, function: {function}, arg_types: {arg_types:?})"
    )]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("The submitted query has a syntax error")]
    SyntaxError,

    #[error("The logged user is not authorized to perform the query")]
    Unauthorized,

    #[error("The query is syntactically correct but invalid")]
    Invalid,

    #[error("The query is invalid because of a configuration issue")]
    ConfigError,

    #[error("Attempted to create an already existing keyspace or table (keyspace: {keyspace}, table: {table})")]
    AlreadyExists { keyspace: String, table: String },

    /// The coordinator does not know the prepared statement; carries the
    /// id the driver should reprepare.
    #[error("The prepared statement is not known to the coordinator")]
    Unprepared { statement_id: Bytes },

    #[error("Unknown error code: {0:#010x}")]
    Other(i32),
}

impl DbError {
    /// Whether the error may be transient on this node and a different
    /// node is worth trying regardless of statement idempotency.
    pub fn can_retry_on_next_node(&self) -> bool {
        matches!(
            self,
            DbError::IsBootstrapping | DbError::TruncateError
        )
    }
}

/// The kind of write operation reported in write timeouts and failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl From<&str> for WriteType {
    fn from(name: &str) -> Self {
        match name {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            other => WriteType::Other(other.to_owned()),
        }
    }
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteType::Simple => f.write_str("SIMPLE"),
            WriteType::Batch => f.write_str("BATCH"),
            WriteType::UnloggedBatch => f.write_str("UNLOGGED_BATCH"),
            WriteType::Counter => f.write_str("COUNTER"),
            WriteType::BatchLog => f.write_str("BATCH_LOG"),
            WriteType::Cas => f.write_str("CAS"),
            WriteType::View => f.write_str("VIEW"),
            WriteType::Cdc => f.write_str("CDC"),
            WriteType::Other(other) => f.write_str(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprepared_carries_statement_id() {
        let mut body = Vec::new();
        types::write_int(0x2500, &mut body);
        types::write_string("unprepared", &mut body).unwrap();
        types::write_short_bytes(&[0xca, 0xfe], &mut body).unwrap();

        let err = Error::deserialize(ProtocolVersion::V4, &mut &body[..]).unwrap();
        assert_eq!(
            err.error,
            DbError::Unprepared {
                statement_id: Bytes::from_static(&[0xca, 0xfe])
            }
        );
        assert_eq!(err.reason, "unprepared");
    }

    #[test]
    fn read_timeout_fields() {
        let mut body = Vec::new();
        types::write_int(0x1200, &mut body);
        types::write_string("timed out", &mut body).unwrap();
        types::write_consistency(Consistency::Quorum, &mut body);
        types::write_int(1, &mut body); // received
        types::write_int(2, &mut body); // required
        body.push(0); // data_present

        let mut slice = &body[..];
        let err = Error::deserialize(ProtocolVersion::V4, &mut slice).unwrap();
        assert!(slice.is_empty());
        assert_eq!(
            err.error,
            DbError::ReadTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                required: 2,
                data_present: false,
            }
        );
    }

    #[test]
    fn write_type_round_trip() {
        assert_eq!(WriteType::from("BATCH_LOG"), WriteType::BatchLog);
        assert_eq!(WriteType::from("UNKNOWN").to_string(), "UNKNOWN");
    }
}
