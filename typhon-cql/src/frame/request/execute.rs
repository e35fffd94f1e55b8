use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::protocol::ProtocolVersion;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;
use bytes::Bytes;

pub struct Execute<'a> {
    pub id: Bytes,
    /// The latest known result metadata id of the prepared statement,
    /// sent on v5 so the server can detect stale metadata.
    pub result_metadata_id: Option<Bytes>,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_short_bytes(&self.id, buf)?;

        if version.supports_result_metadata_id() {
            let metadata_id = self
                .result_metadata_id
                .as_deref()
                .unwrap_or_default();
            types::write_short_bytes(metadata_id, buf)?;
        }

        if version == ProtocolVersion::V1 {
            // v1 EXECUTE: values directly, then consistency.
            self.parameters.values.write_to_request(buf);
            types::write_consistency(self.parameters.consistency, buf);
            return Ok(());
        }

        self.parameters.serialize(version, buf)
    }
}
