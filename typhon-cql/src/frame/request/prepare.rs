use std::borrow::Cow;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

const FLAG_WITH_KEYSPACE: u32 = 0x01;

pub struct Prepare<'a> {
    pub query: &'a str,
    /// Per-request keyspace, v5 only.
    pub keyspace: Option<Cow<'a, str>>,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_long_string(self.query, buf)?;
        if version.supports_per_request_keyspace() {
            match &self.keyspace {
                Some(keyspace) => {
                    types::write_int(FLAG_WITH_KEYSPACE as i32, buf);
                    types::write_string(keyspace, buf)?;
                }
                None => types::write_int(0, buf),
            }
        } else if self.keyspace.is_some() {
            return Err(RequestSerializationError::KeyspaceUnsupported);
        }
        Ok(())
    }
}
