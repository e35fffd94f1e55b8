//! Errors of the frame layer: framing, compression and low-level
//! deserialization of wire primitives.

use thiserror::Error;

/// An error that occurred while framing or deframing a protocol message.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] LowLevelDeserializationError),
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Frame uses protocol version {0}, which differs from the negotiated one")]
    VersionMismatch(u8),
    #[error("Connection was closed before body was read: missing {0} out of {1} bytes")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed: {0}")]
    FrameDecompression(#[from] lz4_flex::block::DecompressError),
    #[error("Frame body length does not fit in usize")]
    BodyLengthOverflow,
    #[error("Unknown response opcode: {0:#04x}")]
    UnknownResponseOpcode(u8),
    #[error(transparent)]
    RequestSerialization(#[from] RequestSerializationError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A low-level deserialization error, raised when one of the `[int]`,
/// `[short]`, `[string]`, ... wire primitives cannot be read.
#[derive(Error, Debug)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Expected {expected} bytes, but only {received} remain in the buffer")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Length is negative where a non-negative value was expected: {0}")]
    UnexpectedNegativeLength(i32),
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Invalid inet address length: {0} (expected 4 or 16)")]
    InvalidInetLength(u8),
    #[error("Unknown consistency: {0:#06x}")]
    UnknownConsistency(u16),
    #[error("Unknown serial consistency: {0:#06x}")]
    UnknownSerialConsistency(u16),
    #[error("String is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl From<std::num::TryFromIntError> for LowLevelDeserializationError {
    fn from(_: std::num::TryFromIntError) -> Self {
        // The only lossy int conversions performed by the wire readers are
        // negative-length checks.
        Self::UnexpectedNegativeLength(-1)
    }
}

impl From<std::array::TryFromSliceError> for LowLevelDeserializationError {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Self::TooFewBytesReceived {
            expected: 0,
            received: 0,
        }
    }
}

/// An error that occurred while serializing a request frame.
#[derive(Error, Debug)]
pub enum RequestSerializationError {
    #[error("A string or blob exceeds the length representable on the wire")]
    LengthOverflow,
    #[error("Named values require protocol version 3 or newer")]
    NamedValuesUnsupported,
    #[error("Per-request keyspace requires protocol version 5")]
    KeyspaceUnsupported,
    #[error("Unset values require protocol version 4 or newer")]
    UnsetUnsupported,
    #[error("Bound values are not supported by protocol version {0}")]
    ValuesUnsupported(crate::frame::protocol::ProtocolVersion),
    #[error("BATCH requires protocol version 2 or newer")]
    BatchUnsupported,
    #[error("Client-side timestamps require protocol version 3 or newer, got {0}")]
    TimestampUnsupported(crate::frame::protocol::ProtocolVersion),
    #[error("Value serialization failed: {0}")]
    Value(#[from] crate::serialize::SerializeError),
}

impl From<std::num::TryFromIntError> for RequestSerializationError {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::LengthOverflow
    }
}

/// An error that occurred while parsing a response body.
///
/// Every response parser must consume its body entirely; leftover bytes are
/// reported as [`ResponseParseError::TrailingBytes`].
#[derive(Error, Debug)]
pub enum ResponseParseError {
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error("Response body has {remaining} trailing garbage bytes")]
    TrailingBytes { remaining: usize },
    #[error("Unknown RESULT kind: {0:#010x}")]
    UnknownResultKind(i32),
    #[error("Unknown error code: {0:#010x}")]
    UnknownErrorCode(i32),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Unknown schema change type: {0}")]
    UnknownSchemaChangeType(String),
    #[error("Unknown status change type: {0}")]
    UnknownStatusChangeType(String),
    #[error("Unknown write type: {0}")]
    UnknownWriteType(String),
    #[error("Column type not implemented: {0:#06x}")]
    TypeNotImplemented(u16),
    #[error("Rows column count mismatch: {on_wire} on the wire, {known} known")]
    ColumnCountMismatch { on_wire: usize, known: usize },
    #[error("Malformed custom type name: {0}")]
    MalformedCustomType(String),
    #[error("Value deserialization failed: {0}")]
    Value(#[from] crate::deserialize::DeserializeError),
}

impl From<std::io::Error> for ResponseParseError {
    fn from(err: std::io::Error) -> Self {
        Self::LowLevel(err.into())
    }
}

impl From<std::num::TryFromIntError> for ResponseParseError {
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::LowLevel(err.into())
    }
}
