use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::{RequestOpcode, SerializableRequest};

/// OPTIONS carries no body. It doubles as the keepalive request.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        _buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        Ok(())
    }
}
